//! Job run history: in-memory ring buffer with optional SQLite persistence.

use std::collections::VecDeque;
use std::path::Path;

use brgy_core::error::{BrgyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runs kept in memory.
const HISTORY_CAPACITY: usize = 100;

/// One finished execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub job_id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    /// Job summary on success, error text on failure.
    pub message: String,
}

/// SQLite store for job runs. Shares the records database file.
pub struct SchedulerDb {
    conn: rusqlite::Connection,
}

impl SchedulerDb {
    /// Open or create the scheduler tables in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| BrgyError::Database(format!("DB open: {e}")))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|e| BrgyError::Database(format!("DB pragma: {e}")))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| BrgyError::Database(format!("DB open: {e}")))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS job_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                job_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                ok INTEGER NOT NULL,
                message TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, id);
         ",
            )
            .map_err(|e| BrgyError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    pub fn record_run(&self, run: &JobRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO job_runs (job_id, job_name, started_at, finished_at, ok, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    run.job_id,
                    run.job_name,
                    run.started_at.to_rfc3339(),
                    run.finished_at.to_rfc3339(),
                    run.ok as i32,
                    run.message,
                ],
            )
            .map_err(|e| BrgyError::Database(format!("Record run: {e}")))?;
        Ok(())
    }

    /// Most recent runs first, optionally for a single job.
    pub fn recent_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<JobRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, job_name, started_at, finished_at, ok, message FROM job_runs
                 WHERE ?1 IS NULL OR job_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| BrgyError::Database(format!("Query runs: {e}")))?;

        let rows = stmt
            .query_map(rusqlite::params![job_id, limit as i64], |row| {
                let started: String = row.get(2)?;
                let finished: String = row.get(3)?;
                Ok(JobRun {
                    job_id: row.get(0)?,
                    job_name: row.get(1)?,
                    started_at: parse_ts(2, &started)?,
                    finished_at: parse_ts(3, &finished)?,
                    ok: row.get::<_, i32>(4)? != 0,
                    message: row.get(5)?,
                })
            })
            .map_err(|e| BrgyError::Database(format!("Query runs: {e}")))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| BrgyError::Database(format!("Read runs: {e}")))
    }
}

fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Recent runs kept by the engine.
pub struct RunHistory {
    runs: VecDeque<JobRun>,
    db: Option<SchedulerDb>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self {
            runs: VecDeque::with_capacity(HISTORY_CAPACITY),
            db: None,
        }
    }

    /// Also persist every recorded run.
    pub fn attach_db(&mut self, db: SchedulerDb) {
        self.db = Some(db);
    }

    pub fn record(&mut self, run: JobRun) {
        if let Some(db) = &self.db {
            if let Err(e) = db.record_run(&run) {
                tracing::warn!("Failed to persist run of '{}': {e}", run.job_id);
            }
        }
        if self.runs.len() == HISTORY_CAPACITY {
            self.runs.pop_front();
        }
        self.runs.push_back(run);
    }

    /// Runs in the order they finished.
    pub fn runs(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter()
    }

    pub fn last_for(&self, job_id: &str) -> Option<&JobRun> {
        self.runs.iter().rev().find(|r| r.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(job_id: &str, ok: bool) -> JobRun {
        let now = Utc::now();
        JobRun {
            job_id: job_id.into(),
            job_name: job_id.to_uppercase(),
            started_at: now,
            finished_at: now,
            ok,
            message: if ok { "done".into() } else { "boom".into() },
        }
    }

    #[test]
    fn test_ring_buffer_keeps_last_100() {
        let mut history = RunHistory::new();
        for i in 0..105 {
            history.record(run(&format!("job-{i}"), true));
        }
        assert_eq!(history.len(), 100);
        assert_eq!(history.runs().next().unwrap().job_id, "job-5");
    }

    #[test]
    fn test_last_for() {
        let mut history = RunHistory::new();
        history.record(run("a", true));
        history.record(run("b", true));
        history.record(run("a", false));
        let last = history.last_for("a").unwrap();
        assert!(!last.ok);
        assert!(history.last_for("missing").is_none());
    }

    #[test]
    fn test_persisted_runs() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.record_run(&run("a", true)).unwrap();
        db.record_run(&run("b", false)).unwrap();
        db.record_run(&run("a", false)).unwrap();

        let all = db.recent_runs(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].job_id, "a");
        assert!(!all[0].ok);

        let only_b = db.recent_runs(Some("b"), 10).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].message, "boom");
    }

    #[test]
    fn test_corrupt_run_timestamp_is_an_error() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.record_run(&run("a", true)).unwrap();
        db.conn
            .execute("UPDATE job_runs SET started_at = 'soon'", [])
            .unwrap();
        assert!(matches!(db.recent_runs(None, 10), Err(BrgyError::Database(_))));
    }

    #[test]
    fn test_open_file_db() {
        let dir = std::env::temp_dir().join("brgy-sched-history-test");
        std::fs::create_dir_all(&dir).ok();
        let db = SchedulerDb::open(&dir.join("runs.db")).unwrap();
        assert!(db.recent_runs(None, 5).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
