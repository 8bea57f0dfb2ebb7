//! Records database: SQLite schema for follow-ups, encounters, staff
//! routing and the notification outbox.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use brgy_core::error::{BrgyError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{DomainEvent, FollowUpStatus, FollowUpVisit, PatientRecord, Staff};
use crate::notify::{DeliveryStatus, NewNotification, Notification, NotifyPriority};

/// Shared records database handle. Jobs hold it behind an `Arc`.
pub struct RecordsDb {
    conn: Mutex<Connection>,
}

const FOLLOWUP_SELECT: &str = "SELECT id, patrec_id, scheduled_date, status, description, completed_at, created_at FROM followup_visits";
const STAFF_SELECT: &str = "SELECT s.staff_id, s.person_id, s.category, s.position FROM staff s";
const NOTIFICATION_SELECT: &str = "SELECT id, title, message, notif_type, source, priority, status, attempts, last_error, channel, created_at, sent_at FROM notifications";

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> BrgyError + '_ {
    move |e| BrgyError::Database(format!("{context}: {e}"))
}

/// Timestamps are stored as `YYYY-MM-DDTHH:MM:SSZ`, which sorts as text
/// in time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_date(col: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Pending visits due for reconciliation.
#[derive(Debug, Default)]
pub struct StaleScan {
    pub visits: Vec<FollowUpVisit>,
    /// Rows that matched but could not be decoded. Logged and left alone.
    pub undecodable: usize,
}

fn row_to_followup(row: &rusqlite::Row) -> rusqlite::Result<FollowUpVisit> {
    let status: String = row.get(3)?;
    let completed_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(FollowUpVisit {
        id: row.get(0)?,
        patrec_id: row.get(1)?,
        scheduled_date: parse_date(2, &row.get::<_, String>(2)?)?,
        status: status.parse().map_err(|e: BrgyError| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        description: row.get(4)?,
        completed_at: completed_at.as_deref().map(|s| parse_ts(5, s)).transpose()?,
        created_at: parse_ts(6, &created_at)?,
    })
}

fn row_to_staff(row: &rusqlite::Row) -> rusqlite::Result<Staff> {
    Ok(Staff {
        staff_id: row.get(0)?,
        person_id: row.get(1)?,
        category: row.get(2)?,
        position: row.get(3)?,
    })
}

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<Notification> {
    let priority: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(10)?;
    let sent_at: Option<String> = row.get(11)?;
    Ok(Notification {
        id: row.get(0)?,
        title: row.get(1)?,
        message: row.get(2)?,
        notif_type: row.get(3)?,
        source: row.get(4)?,
        priority: NotifyPriority::parse(&priority),
        status: DeliveryStatus::parse(&status),
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        channel: row.get(9)?,
        created_at: parse_ts(10, &created_at)?,
        sent_at: sent_at.as_deref().map(|s| parse_ts(11, s)).transpose()?,
        recipients: Vec::new(),
    })
}

impl RecordsDb {
    /// Open or create the records database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("DB pragma"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BrgyError::Database(format!("connection lock poisoned: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS patient_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL,
                record_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followup_visits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patrec_id INTEGER NOT NULL,
                scheduled_date TEXT NOT NULL,           -- YYYY-MM-DD
                status TEXT NOT NULL DEFAULT 'pending', -- pending, scheduled, completed, missed
                description TEXT NOT NULL DEFAULT '',
                completed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_followup_status_date
                ON followup_visits(status, scheduled_date);

            -- Any clinical record created for a patient after the fact
            CREATE TABLE IF NOT EXISTS domain_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_patient ON domain_events(patient_id, created_at);

            CREATE TABLE IF NOT EXISTS staff (
                staff_id TEXT PRIMARY KEY,
                person_id TEXT,
                category TEXT NOT NULL,
                position TEXT
            );

            CREATE TABLE IF NOT EXISTS features (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feature_assignments (
                feature_id INTEGER NOT NULL,
                staff_id TEXT NOT NULL,
                assigned_at TEXT NOT NULL,
                PRIMARY KEY (feature_id, staff_id),
                FOREIGN KEY (feature_id) REFERENCES features(id) ON DELETE CASCADE,
                FOREIGN KEY (staff_id) REFERENCES staff(staff_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                notif_type TEXT NOT NULL,
                source TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, sent, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                channel TEXT,
                created_at TEXT NOT NULL,
                sent_at TEXT
            );

            CREATE TABLE IF NOT EXISTS notification_recipients (
                notification_id INTEGER NOT NULL,
                person_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (notification_id, person_id),
                FOREIGN KEY (notification_id) REFERENCES notifications(id) ON DELETE CASCADE
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Patient records & follow-ups ─────────────────────────

    pub fn create_patient_record(&self, patient_id: &str, record_type: &str) -> Result<PatientRecord> {
        let conn = self.conn()?;
        let now = Utc::now().trunc_subsecs(0);
        conn.execute(
            "INSERT INTO patient_records (patient_id, record_type, created_at) VALUES (?1, ?2, ?3)",
            params![patient_id, record_type, ts(now)],
        )
        .map_err(db_err("Create patient record"))?;
        Ok(PatientRecord {
            id: conn.last_insert_rowid(),
            patient_id: patient_id.to_string(),
            record_type: record_type.to_string(),
            created_at: now,
        })
    }

    pub fn get_patient_record(&self, id: i64) -> Result<Option<PatientRecord>> {
        self.conn()?
            .query_row(
                "SELECT id, patient_id, record_type, created_at FROM patient_records WHERE id = ?1",
                [id],
                |row| {
                    let created_at: String = row.get(3)?;
                    Ok(PatientRecord {
                        id: row.get(0)?,
                        patient_id: row.get(1)?,
                        record_type: row.get(2)?,
                        created_at: parse_ts(3, &created_at)?,
                    })
                },
            )
            .optional()
            .map_err(db_err("Get patient record"))
    }

    /// Schedule a follow-up visit in `pending` state.
    pub fn create_followup(
        &self,
        patrec_id: i64,
        scheduled_date: NaiveDate,
        description: &str,
    ) -> Result<FollowUpVisit> {
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO followup_visits (patrec_id, scheduled_date, status, description, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![patrec_id, scheduled_date.to_string(), description, ts(Utc::now())],
            )
            .map_err(db_err("Create follow-up"))?;
            conn.last_insert_rowid()
        };
        self.get_followup(id)?
            .ok_or_else(|| BrgyError::NotFound(format!("follow-up visit {id}")))
    }

    pub fn get_followup(&self, id: i64) -> Result<Option<FollowUpVisit>> {
        self.conn()?
            .query_row(&format!("{FOLLOWUP_SELECT} WHERE id = ?1"), [id], row_to_followup)
            .optional()
            .map_err(db_err("Get follow-up"))
    }

    /// Set a visit's status unconditionally (clinical workflow).
    pub fn update_followup_status(&self, id: i64, status: FollowUpStatus) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE followup_visits SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(db_err("Update follow-up"))?;
        if changed == 0 {
            return Err(BrgyError::NotFound(format!("follow-up visit {id}")));
        }
        Ok(())
    }

    /// Pending visits scheduled on or before `cutoff`, oldest first.
    ///
    /// A row that fails to decode is logged and counted instead of failing
    /// the scan.
    pub fn stale_pending_followups(&self, cutoff: NaiveDate) -> Result<StaleScan> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{FOLLOWUP_SELECT} WHERE status = 'pending' AND scheduled_date <= ?1
                 ORDER BY scheduled_date, id"
            ))
            .map_err(db_err("Query stale follow-ups"))?;
        let mut rows = stmt
            .query([cutoff.to_string()])
            .map_err(db_err("Query stale follow-ups"))?;

        let mut scan = StaleScan::default();
        while let Some(row) = rows.next().map_err(db_err("Read follow-ups"))? {
            match row_to_followup(row) {
                Ok(visit) => scan.visits.push(visit),
                Err(e) => {
                    let id: Option<i64> = row.get(0).ok();
                    tracing::warn!("Follow-up {}: unreadable row, skipping: {e}", id.unwrap_or_default());
                    scan.undecodable += 1;
                }
            }
        }
        Ok(scan)
    }

    /// Pending → missed. Returns `false` if the row was no longer pending.
    pub fn mark_missed(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE followup_visits SET status = 'missed' WHERE id = ?1 AND status = 'pending'",
                [id],
            )
            .map_err(db_err("Mark missed"))?;
        Ok(changed == 1)
    }

    /// Pending → completed. Returns `false` if the row was no longer pending.
    pub fn mark_completed(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE followup_visits SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![ts(at), id],
            )
            .map_err(db_err("Mark completed"))?;
        Ok(changed == 1)
    }

    // ─── Domain events ─────────────────────────────────────────

    pub fn record_event(
        &self,
        patient_id: &str,
        kind: &str,
        created_at: DateTime<Utc>,
    ) -> Result<DomainEvent> {
        let created_at = created_at.trunc_subsecs(0);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO domain_events (patient_id, kind, created_at) VALUES (?1, ?2, ?3)",
            params![patient_id, kind, ts(created_at)],
        )
        .map_err(db_err("Record event"))?;
        Ok(DomainEvent {
            id: conn.last_insert_rowid(),
            patient_id: patient_id.to_string(),
            kind: kind.to_string(),
            created_at,
        })
    }

    /// Whether the patient has any event created at or after `since`.
    pub fn has_event_since(&self, patient_id: &str, since: DateTime<Utc>) -> Result<bool> {
        self.conn()?
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM domain_events
                 WHERE patient_id = ?1 AND created_at >= ?2)",
                params![patient_id, ts(since)],
                |row| row.get::<_, bool>(0),
            )
            .map_err(db_err("Query events"))
    }

    /// Cheap round trip used to tell a bad row from a bad connection.
    pub fn ping(&self) -> Result<()> {
        self.conn()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(db_err("Ping"))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).map_err(db_err("Raw execute"))
    }

    // ─── Staff & features ──────────────────────────────────────

    /// Insert or replace a staff member.
    pub fn upsert_staff(
        &self,
        staff_id: &str,
        person_id: Option<&str>,
        category: &str,
        position: Option<&str>,
    ) -> Result<Staff> {
        self.conn()?
            .execute(
                "INSERT INTO staff (staff_id, person_id, category, position) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(staff_id) DO UPDATE SET
                    person_id = excluded.person_id,
                    category = excluded.category,
                    position = excluded.position",
                params![staff_id, person_id, category, position],
            )
            .map_err(db_err("Upsert staff"))?;
        Ok(Staff {
            staff_id: staff_id.to_string(),
            person_id: person_id.map(String::from),
            category: category.to_string(),
            position: position.map(String::from),
        })
    }

    /// Create a feature if missing and return its id.
    pub fn ensure_feature(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT OR IGNORE INTO features (name) VALUES (?1)", [name])
            .map_err(db_err("Create feature"))?;
        conn.query_row("SELECT id FROM features WHERE name = ?1", [name], |row| row.get(0))
            .map_err(db_err("Get feature"))
    }

    /// Assign a staff member to a feature. Assigning twice is a no-op.
    pub fn assign_feature(&self, staff_id: &str, feature_name: &str) -> Result<()> {
        let feature_id = self.ensure_feature(feature_name)?;
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO feature_assignments (feature_id, staff_id, assigned_at)
                 VALUES (?1, ?2, ?3)",
                params![feature_id, staff_id, ts(Utc::now())],
            )
            .map_err(db_err("Assign feature"))?;
        Ok(())
    }

    /// Staff of `category` assigned to `feature_name`, ordered by staff id.
    pub fn feature_staff(
        &self,
        feature_name: &str,
        category: &str,
        exclude_staff_id: Option<&str>,
    ) -> Result<Vec<Staff>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{STAFF_SELECT}
                 JOIN feature_assignments fa ON fa.staff_id = s.staff_id
                 JOIN features f ON f.id = fa.feature_id
                 WHERE f.name = ?1 AND s.category = ?2 AND (?3 IS NULL OR s.staff_id <> ?3)
                 ORDER BY s.staff_id"
            ))
            .map_err(db_err("Query feature staff"))?;
        let rows = stmt
            .query_map(params![feature_name, category, exclude_staff_id], row_to_staff)
            .map_err(db_err("Query feature staff"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read staff"))
    }

    /// Staff of `category` holding `position`, ordered by staff id.
    pub fn staff_by_position(
        &self,
        position: &str,
        category: &str,
        exclude_staff_id: Option<&str>,
    ) -> Result<Vec<Staff>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{STAFF_SELECT}
                 WHERE s.position = ?1 AND s.category = ?2 AND (?3 IS NULL OR s.staff_id <> ?3)
                 ORDER BY s.staff_id"
            ))
            .map_err(db_err("Query staff"))?;
        let rows = stmt
            .query_map(params![position, category, exclude_staff_id], row_to_staff)
            .map_err(db_err("Query staff"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read staff"))
    }

    // ─── Notification outbox ───────────────────────────────────

    /// Write a notification and its recipients in one transaction.
    pub fn save_notification(&self, notification: &NewNotification, recipients: &[String]) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        tx.execute(
            "INSERT INTO notifications (title, message, notif_type, source, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                notification.title,
                notification.message,
                notification.notif_type,
                notification.source,
                notification.priority.as_str(),
                ts(Utc::now()),
            ],
        )
        .map_err(db_err("Save notification"))?;
        let id = tx.last_insert_rowid();
        for (position, person_id) in recipients.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO notification_recipients (notification_id, person_id, position)
                 VALUES (?1, ?2, ?3)",
                params![id, person_id, position as i64],
            )
            .map_err(db_err("Save recipient"))?;
        }
        tx.commit().map_err(db_err("Commit"))?;
        Ok(id)
    }

    fn load_recipients(conn: &Connection, notification_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT person_id FROM notification_recipients
                 WHERE notification_id = ?1 ORDER BY position",
            )
            .map_err(db_err("Query recipients"))?;
        let rows = stmt
            .query_map([notification_id], |row| row.get(0))
            .map_err(db_err("Query recipients"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err("Read recipients"))
    }

    fn query_notifications(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{NOTIFICATION_SELECT} {where_clause}"))
            .map_err(db_err("Query notifications"))?;
        let mut notifications = stmt
            .query_map(params, row_to_notification)
            .map_err(db_err("Query notifications"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read notifications"))?;
        for n in notifications.iter_mut() {
            n.recipients = Self::load_recipients(&conn, n.id)?;
        }
        Ok(notifications)
    }

    pub fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        Ok(self.query_notifications("WHERE id = ?1", [id])?.pop())
    }

    /// Undelivered notifications that still have attempts left, oldest first.
    pub fn pending_notifications(&self, limit: usize, max_attempts: u32) -> Result<Vec<Notification>> {
        self.query_notifications(
            "WHERE status IN ('pending', 'failed') AND attempts < ?1 ORDER BY id LIMIT ?2",
            params![max_attempts, limit as i64],
        )
    }

    /// Most recent notifications first.
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        self.query_notifications("ORDER BY id DESC LIMIT ?1", [limit as i64])
    }

    pub fn mark_notification_sent(&self, id: i64, channel: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE notifications SET status = 'sent', channel = ?1, sent_at = ?2,
                    attempts = attempts + 1, last_error = NULL
                 WHERE id = ?3",
                params![channel, ts(Utc::now()), id],
            )
            .map_err(db_err("Mark sent"))?;
        Ok(())
    }

    pub fn mark_notification_failed(&self, id: i64, channel: &str, error: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE notifications SET status = 'failed', channel = ?1,
                    attempts = attempts + 1, last_error = ?2
                 WHERE id = ?3",
                params![channel, error, id],
            )
            .map_err(db_err("Mark failed"))?;
        Ok(())
    }
}
