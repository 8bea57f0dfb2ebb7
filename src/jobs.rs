//! Maintenance job registration: wires the records routines into the
//! scheduler engine according to the loaded config.

use std::sync::Arc;

use brgy_core::config::BrgyConfig;
use brgy_core::error::{BrgyError, Result};
use brgy_records::{FollowUpReconciler, RecordsDb, dispatch_pending, target_from_config};
use brgy_scheduler::{Job, SchedulerEngine, handler};
use chrono::{FixedOffset, Utc};

pub const FOLLOWUP_JOB_ID: &str = "followup-reconcile";
pub const DISPATCH_JOB_ID: &str = "notification-dispatch";

/// Register every enabled maintenance job. Returns how many were registered.
pub fn register_jobs(
    engine: &mut SchedulerEngine,
    config: &BrgyConfig,
    db: Arc<RecordsDb>,
    offset: FixedOffset,
) -> Result<usize> {
    let mut count = 0;

    if config.followups.enabled {
        let reconciler = Arc::new(FollowUpReconciler::from_config(db.clone(), &config.followups, offset));
        let grace = config.followups.grace_period_days;
        engine.register(
            Job::cron(FOLLOWUP_JOB_ID, "Mark missed follow-up visits", &config.followups.cron),
            handler(move || {
                let reconciler = reconciler.clone();
                async move {
                    let as_of = Utc::now().with_timezone(&offset).date_naive();
                    let report = tokio::task::spawn_blocking(move || {
                        reconciler.reconcile_followups(as_of, grace)
                    })
                    .await
                    .map_err(|e| BrgyError::Scheduler(format!("reconcile task failed: {e}")))??;
                    Ok::<_, BrgyError>(report.to_string())
                }
            }),
        )?;
        count += 1;
    } else {
        tracing::info!("Follow-up reconciliation disabled in config");
    }

    if config.notifications.enabled {
        let target = Arc::new(target_from_config(&config.notifications));
        let batch_size = config.notifications.batch_size;
        let max_attempts = config.notifications.max_attempts;
        engine.register(
            Job::interval(
                DISPATCH_JOB_ID,
                "Deliver queued notifications",
                config.notifications.dispatch_interval_secs,
            ),
            handler(move || {
                let db = db.clone();
                let target = target.clone();
                async move {
                    let report = dispatch_pending(db, &target, batch_size, max_attempts).await?;
                    Ok::<_, BrgyError>(format!("{} sent, {} failed", report.sent, report.failed))
                }
            }),
        )?;
        count += 1;
    }

    Ok(count)
}
