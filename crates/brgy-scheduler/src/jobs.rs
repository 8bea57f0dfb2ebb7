//! Job definitions: the data model for scheduled maintenance work.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::cron;

/// A named, scheduled job. The id is chosen by the registrar and is the
/// key for replace-existing registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable job identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// When/how the job triggers.
    pub trigger: Trigger,
    /// Current state.
    pub state: JobState,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time the job started.
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled start.
    pub next_run: Option<DateTime<Utc>>,
    /// How many times the job has started.
    pub run_count: u32,
    /// Error message of the most recent failed run, cleared on success.
    pub last_error: Option<String>,
    pub enabled: bool,
}

/// How/when the job triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Trigger {
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
    /// Run on a cron schedule, evaluated in the scheduler's offset.
    Cron { expression: String },
    /// Run every N seconds.
    Interval { every_secs: u64 },
}

/// Job lifecycle. A job that is not registered at all is "not scheduled".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Disabled,
}

impl Job {
    fn new(id: &str, name: &str, trigger: Trigger) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            trigger,
            state: JobState::Idle,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            run_count: 0,
            last_error: None,
            enabled: true,
        }
    }

    /// Create a one-time job.
    pub fn once(id: &str, name: &str, at: DateTime<Utc>) -> Self {
        let mut job = Self::new(id, name, Trigger::Once { at });
        job.next_run = Some(at);
        job
    }

    /// Create a recurring interval job. First run is one interval from now.
    pub fn interval(id: &str, name: &str, every_secs: u64) -> Self {
        let mut job = Self::new(id, name, Trigger::Interval { every_secs });
        job.next_run = interval_after(Utc::now(), every_secs);
        job
    }

    /// Create a cron-scheduled job. `next_run` is computed on registration.
    pub fn cron(id: &str, name: &str, expression: &str) -> Self {
        Self::new(
            id,
            name,
            Trigger::Cron {
                expression: expression.to_string(),
            },
        )
    }

    /// Check if this job should start at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.state != JobState::Idle {
            return false;
        }
        match &self.next_run {
            Some(next) => now >= *next,
            None => false,
        }
    }

    /// Advance `next_run` past `now` according to the trigger.
    pub fn advance(&mut self, now: DateTime<Utc>, offset: FixedOffset) {
        self.next_run = match &self.trigger {
            Trigger::Once { .. } => None,
            Trigger::Interval { every_secs } => interval_after(now, *every_secs),
            Trigger::Cron { expression } => cron::next_run_from_cron(expression, now, offset),
        };
    }

    /// Fill in `next_run` for cron jobs that have none or whose slot is already past.
    pub fn ensure_next_run(&mut self, now: DateTime<Utc>, offset: FixedOffset) {
        if let Trigger::Cron { expression } = &self.trigger {
            if self.next_run.is_none_or(|nr| nr < now) {
                self.next_run = cron::next_run_from_cron(expression, now, offset);
            }
        }
    }
}

/// `now + every_secs`, or `None` when that falls outside chrono's range.
pub(crate) fn interval_after(now: DateTime<Utc>, every_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(every_secs).ok()?;
    now.checked_add_signed(TimeDelta::try_seconds(secs)?)
}
