//! # brgy-scheduler
//!
//! Owned, in-process job scheduler for the barangay maintenance routines.
//!
//! ## Design
//! - One engine instance per process, created at startup and passed to
//!   the code that registers jobs. No global state.
//! - Tokio interval loop; each due job runs on its own task, so
//!   independent jobs overlap freely while a job never overlaps itself.
//! - Failures are logged and recorded in the run history; the next
//!   trigger fires regardless. No retries.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval)
//!   ├── Cron:     "0 1 * * *"  → followup-reconcile
//!   ├── Interval: every 60s    → notification-dispatch
//!   ├── Once:     at T         → one-shot maintenance
//!   └── on finish → RunHistory (ring buffer + job_runs table)
//! ```

pub mod cron;
pub mod engine;
pub mod history;
pub mod jobs;

pub use cron::CronSchedule;
pub use engine::{
    DueJob, JobHandler, SchedulerEngine, SchedulerHandle, handler, run_job, spawn_scheduler,
};
pub use history::{JobRun, RunHistory, SchedulerDb};
pub use jobs::{Job, JobState, Trigger};
