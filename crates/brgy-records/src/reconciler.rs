//! Follow-up reconciliation: flips stale pending visits to missed.
//!
//! A pending visit is stale once its scheduled date is at least the grace
//! period behind the run date. If the patient has any clinical record
//! created after the scheduled day (in barangay local time) the visit is
//! satisfied; otherwise it is marked missed. Every write is conditional on
//! the row still being pending, so repeated or concurrent runs cannot
//! transition a row twice.

use std::fmt;
use std::sync::Arc;

use brgy_core::config::{FollowUpConfig, SatisfiedPolicy};
use brgy_core::error::{BrgyError, Result};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::db::RecordsDb;
use crate::models::{FollowUpVisit, PatientRecord};
use crate::notify::NewNotification;
use crate::recipients::resolve_recipients;

/// Where missed-visit notices go.
#[derive(Debug, Clone)]
pub struct MissedNotice {
    pub feature: String,
    pub staff_category: String,
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stale pending visits examined, including unreadable rows.
    pub scanned: usize,
    /// Status changes written (missed + completed).
    pub updated: usize,
    pub missed: usize,
    pub completed: usize,
    /// Satisfied visits left pending.
    pub satisfied: usize,
    /// Visits left alone: unreadable row, missing patient record, or a
    /// failed lookup or write.
    pub skipped: usize,
    pub notifications: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}, updated {} (missed {}, completed {}), satisfied {}, skipped {}, notifications {}",
            self.scanned,
            self.updated,
            self.missed,
            self.completed,
            self.satisfied,
            self.skipped,
            self.notifications
        )
    }
}

pub struct FollowUpReconciler {
    db: Arc<RecordsDb>,
    policy: SatisfiedPolicy,
    /// Offset in which scheduled dates are calendar days.
    offset: FixedOffset,
    notice: Option<MissedNotice>,
}

impl FollowUpReconciler {
    pub fn new(db: Arc<RecordsDb>, policy: SatisfiedPolicy, offset: FixedOffset) -> Self {
        Self {
            db,
            policy,
            offset,
            notice: None,
        }
    }

    /// Build from the `[followups]` config section.
    pub fn from_config(db: Arc<RecordsDb>, config: &FollowUpConfig, offset: FixedOffset) -> Self {
        let mut reconciler = Self::new(db, config.satisfied_policy, offset);
        if config.notify_on_missed {
            reconciler = reconciler.with_notice(MissedNotice {
                feature: config.notify_feature.clone(),
                staff_category: config.staff_category.clone(),
            });
        }
        reconciler
    }

    /// Emit a notification for every visit marked missed.
    pub fn with_notice(mut self, notice: MissedNotice) -> Self {
        self.notice = Some(notice);
        self
    }

    /// Reconcile all pending visits scheduled on or before
    /// `as_of - grace_period_days`.
    ///
    /// A visit that cannot be processed is logged and skipped and the run
    /// continues. The run aborts only when the database itself stops
    /// answering.
    pub fn reconcile_followups(&self, as_of: NaiveDate, grace_period_days: u32) -> Result<ReconcileReport> {
        let cutoff = as_of
            .checked_sub_days(Days::new(grace_period_days as u64))
            .ok_or_else(|| BrgyError::Config(format!("grace period of {grace_period_days} days underflows {as_of}")))?;

        let stale = self.db.stale_pending_followups(cutoff)?;
        tracing::info!(
            "Reconciling {} pending follow-up(s) scheduled on or before {} (as of {}, grace {}d)",
            stale.visits.len(),
            cutoff,
            as_of,
            grace_period_days
        );

        let mut report = ReconcileReport {
            scanned: stale.visits.len() + stale.undecodable,
            skipped: stale.undecodable,
            ..Default::default()
        };

        for visit in &stale.visits {
            if let Err(e) = self.reconcile_visit(visit, &mut report) {
                self.db.ping()?;
                tracing::warn!("Follow-up {}: {e}, skipping", visit.id);
                report.skipped += 1;
            }
        }

        tracing::info!("Follow-up reconciliation done: {report}");
        Ok(report)
    }

    fn reconcile_visit(&self, visit: &FollowUpVisit, report: &mut ReconcileReport) -> Result<()> {
        let Some(record) = self.db.get_patient_record(visit.patrec_id)? else {
            tracing::warn!(
                "Follow-up {}: patient record {} not found, skipping",
                visit.id,
                visit.patrec_id
            );
            report.skipped += 1;
            return Ok(());
        };

        let day_after = self.day_after(visit.scheduled_date)?;
        if self.db.has_event_since(&record.patient_id, day_after)? {
            return self.satisfy(visit, report);
        }

        if self.db.mark_missed(visit.id)? {
            tracing::info!(
                "Follow-up {} for patient {} ({}) on {} marked missed",
                visit.id,
                record.patient_id,
                record.record_type,
                visit.scheduled_date
            );
            report.missed += 1;
            report.updated += 1;
            if self.notify_missed(visit, &record) {
                report.notifications += 1;
            }
        } else {
            tracing::debug!("Follow-up {} changed concurrently, left as is", visit.id);
        }
        Ok(())
    }

    /// Start of the local day after `date`, as a UTC instant.
    fn day_after(&self, date: NaiveDate) -> Result<DateTime<Utc>> {
        date.succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| BrgyError::Config(format!("no day after {date}")))
    }

    fn satisfy(&self, visit: &FollowUpVisit, report: &mut ReconcileReport) -> Result<()> {
        match self.policy {
            SatisfiedPolicy::LeavePending => {
                tracing::debug!("Follow-up {} satisfied by a later record, left pending", visit.id);
                report.satisfied += 1;
            }
            SatisfiedPolicy::Complete => {
                if self.db.mark_completed(visit.id, Utc::now())? {
                    tracing::info!("Follow-up {} satisfied by a later record, marked completed", visit.id);
                    report.completed += 1;
                    report.updated += 1;
                }
            }
        }
        Ok(())
    }

    /// Write a missed-visit notification. Returns whether one was written.
    fn notify_missed(&self, visit: &FollowUpVisit, record: &PatientRecord) -> bool {
        let Some(notice) = &self.notice else {
            return false;
        };

        let recipients =
            match resolve_recipients(&self.db, &notice.feature, &notice.staff_category, None) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Follow-up {}: recipient lookup failed: {e}", visit.id);
                    return false;
                }
            };
        if recipients.is_empty() {
            tracing::warn!(
                "Follow-up {}: no recipients for feature '{}' ({}), notification not sent",
                visit.id,
                notice.feature,
                notice.staff_category
            );
            return false;
        }

        let notification = NewNotification::missed_followup(visit, record);
        match self.db.save_notification(&notification, &recipients) {
            Ok(id) => {
                tracing::debug!("Notification {id} queued for {} recipient(s)", recipients.len());
                true
            }
            Err(e) => {
                tracing::warn!("Follow-up {}: failed to queue notification: {e}", visit.id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FollowUpStatus;

    fn manila() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn days_ago(n: u64) -> NaiveDate {
        today().checked_sub_days(Days::new(n)).unwrap()
    }

    fn setup() -> (Arc<RecordsDb>, i64) {
        let db = Arc::new(RecordsDb::open_in_memory().unwrap());
        let rec = db.create_patient_record("PAT-001", "Family Planning").unwrap();
        (db, rec.id)
    }

    fn status(db: &RecordsDb, id: i64) -> FollowUpStatus {
        db.get_followup(id).unwrap().unwrap().status
    }

    #[test]
    fn test_no_later_record_marks_missed() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "Pill refill").unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.missed, 1);
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
    }

    #[test]
    fn test_later_record_leaves_pending() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        let two_days_ago = Utc.with_ymd_and_hms(2026, 10, 15, 9, 30, 0).unwrap();
        db.record_event("PAT-001", "FP_Record", two_days_ago).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.updated, 0);
        assert_eq!(report.satisfied, 1);
        assert_eq!(status(&db, visit.id), FollowUpStatus::Pending);
    }

    #[test]
    fn test_record_on_visit_day_does_not_satisfy() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        let same_day = Utc.with_ymd_and_hms(2026, 10, 12, 8, 0, 0).unwrap();
        db.record_event("PAT-001", "encounter", same_day).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
    }

    #[test]
    fn test_other_patients_records_do_not_count() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        db.record_event("PAT-999", "encounter", Utc::now()).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
    }

    #[test]
    fn test_within_grace_period_untouched() {
        let (db, patrec) = setup();
        let edge = db.create_followup(patrec, days_ago(3), "").unwrap();
        let recent = db.create_followup(patrec, days_ago(2), "").unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(status(&db, edge.id), FollowUpStatus::Missed);
        assert_eq!(status(&db, recent.id), FollowUpStatus::Pending);
    }

    #[test]
    fn test_only_pending_visits_selected() {
        let (db, patrec) = setup();
        let scheduled = db.create_followup(patrec, days_ago(10), "").unwrap();
        db.update_followup_status(scheduled.id, FollowUpStatus::Scheduled).unwrap();
        let done = db.create_followup(patrec, days_ago(10), "").unwrap();
        db.update_followup_status(done.id, FollowUpStatus::Completed).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(status(&db, scheduled.id), FollowUpStatus::Scheduled);
        assert_eq!(status(&db, done.id), FollowUpStatus::Completed);
    }

    #[test]
    fn test_idempotent_second_run() {
        let (db, patrec) = setup();
        let missed = db.create_followup(patrec, days_ago(6), "").unwrap();
        let kept = db.create_followup(patrec, days_ago(9), "").unwrap();
        // Satisfies only the older visit: created after day -9 but before day -6.
        let event_at = Utc.with_ymd_and_hms(2026, 10, 9, 10, 0, 0).unwrap();
        db.record_event("PAT-001", "encounter", event_at).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let first = reconciler.reconcile_followups(today(), 3).unwrap();
        let after_first = (status(&db, missed.id), status(&db, kept.id));
        let second = reconciler.reconcile_followups(today(), 3).unwrap();
        let after_second = (status(&db, missed.id), status(&db, kept.id));

        assert_eq!(first.missed, 1);
        assert_eq!(second.updated, 0);
        assert_eq!(after_first, after_second);
        assert_eq!(after_second, (FollowUpStatus::Missed, FollowUpStatus::Pending));
    }

    #[test]
    fn test_complete_policy() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        db.record_event("PAT-001", "FP_Record", Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap())
            .unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::Complete, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.updated, 1);

        let stored = db.get_followup(visit.id).unwrap().unwrap();
        assert_eq!(stored.status, FollowUpStatus::Completed);
        assert!(stored.completed_at.is_some());

        let again = reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(again.updated, 0);
    }

    #[test]
    fn test_missing_patient_record_skipped() {
        let (db, patrec) = setup();
        let orphan = db.create_followup(9999, days_ago(5), "").unwrap();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.missed, 1);
        assert_eq!(status(&db, orphan.id), FollowUpStatus::Pending);
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
    }

    #[test]
    fn test_missed_visit_queues_notification() {
        let (db, patrec) = setup();
        db.upsert_staff("S01", Some("P-midwife"), "HEALTH", Some("MIDWIFE")).unwrap();
        db.upsert_staff("S02", Some("P-admin"), "HEALTH", Some("ADMIN")).unwrap();
        db.assign_feature("S01", "PATIENT RECORDS").unwrap();
        db.create_followup(patrec, days_ago(5), "").unwrap();

        let config = FollowUpConfig {
            notify_on_missed: true,
            ..FollowUpConfig::default()
        };
        let reconciler = FollowUpReconciler::from_config(db.clone(), &config, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(report.notifications, 1);

        let queued = db.pending_notifications(10, 5).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].notif_type, "followup_missed");
        assert_eq!(queued[0].recipients, vec!["P-midwife", "P-admin"]);
    }

    #[test]
    fn test_no_recipients_is_not_fatal() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila())
            .with_notice(MissedNotice {
                feature: "PATIENT RECORDS".into(),
                staff_category: "HEALTH".into(),
            });
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.missed, 1);
        assert_eq!(report.notifications, 0);
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
        assert!(db.pending_notifications(10, 5).unwrap().is_empty());
    }

    #[test]
    fn test_early_morning_local_return_satisfies() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        // 07:00 local on the day after the visit is still the visit day in UTC.
        let returned = manila().with_ymd_and_hms(2026, 10, 13, 7, 0, 0).unwrap();
        db.record_event("PAT-001", "encounter", returned.with_timezone(&Utc)).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.satisfied, 1);
        assert_eq!(status(&db, visit.id), FollowUpStatus::Pending);
    }

    #[test]
    fn test_late_evening_local_visit_day_does_not_satisfy() {
        let (db, patrec) = setup();
        let visit = db.create_followup(patrec, days_ago(5), "").unwrap();
        let evening = manila().with_ymd_and_hms(2026, 10, 12, 23, 59, 0).unwrap();
        db.record_event("PAT-001", "encounter", evening.with_timezone(&Utc)).unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(status(&db, visit.id), FollowUpStatus::Missed);
    }

    #[test]
    fn test_corrupt_rows_do_not_stop_the_run() {
        let (db, patrec) = setup();
        // Unreadable visit row, and a visit whose patient record is unreadable.
        db.execute_raw(
            "INSERT INTO followup_visits (patrec_id, scheduled_date, status, created_at)
             VALUES (1, '2026-10-01', 'pending', 'garbage');
             INSERT INTO patient_records (patient_id, record_type, created_at)
             VALUES ('PAT-002', 'Prenatal', 'garbage');",
        )
        .unwrap();
        let bad_record = db.create_followup(2, days_ago(6), "").unwrap();
        let good = db.create_followup(patrec, days_ago(5), "").unwrap();

        let reconciler = FollowUpReconciler::new(db.clone(), SatisfiedPolicy::LeavePending, manila());
        let report = reconciler.reconcile_followups(today(), 3).unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.missed, 1);
        assert_eq!(status(&db, bad_record.id), FollowUpStatus::Pending);
        assert_eq!(status(&db, good.id), FollowUpStatus::Missed);

        // Later runs keep working past the same rows.
        let again = reconciler.reconcile_followups(today(), 3).unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(again.updated, 0);
    }

    #[test]
    fn test_report_display() {
        let report = ReconcileReport {
            scanned: 3,
            updated: 2,
            missed: 2,
            ..Default::default()
        };
        assert!(report.to_string().starts_with("scanned 3, updated 2 (missed 2"));
    }
}
