//! Scheduler Engine: owns the registered jobs and decides which are due.
//! The loop in [`spawn_scheduler`] ticks on a tokio interval and runs each
//! due job on its own task.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use brgy_core::error::{BrgyError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::history::{JobRun, RunHistory, SchedulerDb};
use crate::jobs::{Job, JobState, Trigger};

/// Future returned by a job body. The string is a one-line run summary.
pub type JobFuture = BoxFuture<'static, Result<String>>;

/// A job body. Called once per trigger.
pub type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`].
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// A job that has been marked running and must be executed by the caller.
pub struct DueJob {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    handler: JobHandler,
}

impl DueJob {
    /// Run the body. Panics inside the job are turned into errors.
    pub async fn execute(&self) -> Result<String> {
        match AssertUnwindSafe((self.handler)()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(BrgyError::Scheduler(format!("job '{}' panicked", self.id))),
        }
    }
}

/// The scheduler engine: manages jobs and hands out due runs.
pub struct SchedulerEngine {
    jobs: Vec<Job>,
    handlers: HashMap<String, JobHandler>,
    offset: FixedOffset,
    history: RunHistory,
}

impl SchedulerEngine {
    /// Create an engine that evaluates cron triggers in `offset`.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            jobs: Vec::new(),
            handlers: HashMap::new(),
            offset,
            history: RunHistory::new(),
        }
    }

    /// Build from a UTC offset in minutes, as found in config.
    pub fn with_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(minutes * 60)
            .ok_or_else(|| BrgyError::Config(format!("invalid UTC offset: {minutes} minutes")))?;
        Ok(Self::new(offset))
    }

    /// Persist run history to `db` as well as keeping it in memory.
    pub fn attach_history_db(&mut self, db: SchedulerDb) {
        self.history.attach_db(db);
    }

    /// Register a job. A job with the same id is replaced rather than
    /// duplicated; returns `true` when that happened.
    pub fn register(&mut self, mut job: Job, handler: JobHandler) -> Result<bool> {
        if let Trigger::Cron { expression } = &job.trigger {
            crate::cron::CronSchedule::parse(expression)?;
        }
        if let Trigger::Interval { every_secs } = job.trigger {
            if job.next_run.is_none() {
                return Err(BrgyError::Config(format!(
                    "job '{}': interval of {every_secs}s is out of range",
                    job.id
                )));
            }
        }
        job.ensure_next_run(Utc::now(), self.offset);

        let replaced = match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                // An in-flight run keeps the job marked running until it finishes.
                if existing.state == JobState::Running {
                    job.state = JobState::Running;
                }
                job.run_count = existing.run_count;
                job.last_run = existing.last_run;
                *existing = job.clone();
                true
            }
            None => {
                self.jobs.push(job.clone());
                false
            }
        };
        self.handlers.insert(job.id.clone(), handler);

        tracing::info!(
            "Job {}: '{}' ({}), next run {}",
            if replaced { "replaced" } else { "registered" },
            job.name,
            job.id,
            job.next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
        );
        Ok(replaced)
    }

    /// Remove a job by id.
    pub fn remove_job(&mut self, id: &str) -> bool {
        let len = self.jobs.len();
        self.jobs.retain(|j| j.id != id);
        self.handlers.remove(id);
        self.jobs.len() < len
    }

    /// List all jobs.
    pub fn list_jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Enable/disable a job. A running job finishes its current run.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        let offset = self.offset;
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) else {
            return false;
        };
        job.enabled = enabled;
        if job.state != JobState::Running {
            job.state = if enabled { JobState::Idle } else { JobState::Disabled };
        }
        if enabled {
            job.ensure_next_run(Utc::now(), offset);
        }
        true
    }

    /// Mark every due job running and return them for execution.
    /// A job whose previous run is still in flight skips this trigger.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut due = Vec::new();

        for job in self.jobs.iter_mut() {
            if job.state == JobState::Running
                && job.next_run.is_some_and(|next| now >= next)
            {
                tracing::warn!("Job '{}' still running, skipping this trigger", job.name);
                job.advance(now, self.offset);
                continue;
            }
            if !job.is_due(now) {
                continue;
            }
            let Some(handler) = self.handlers.get(&job.id) else {
                tracing::warn!("Job '{}' has no handler", job.id);
                continue;
            };

            tracing::info!("Job triggered: '{}'", job.name);
            job.state = JobState::Running;
            job.last_run = Some(now);
            job.run_count += 1;
            job.advance(now, self.offset);

            due.push(DueJob {
                id: job.id.clone(),
                name: job.name.clone(),
                started_at: now,
                handler: handler.clone(),
            });
        }

        due
    }

    /// Start a job immediately, outside its trigger. Fails if it is
    /// unknown or already running.
    pub fn trigger_now(&mut self, id: &str, now: DateTime<Utc>) -> Result<DueJob> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| BrgyError::NotFound(format!("job '{id}'")))?;
        if job.state == JobState::Running {
            return Err(BrgyError::Scheduler(format!("job '{id}' is already running")));
        }
        let handler = self
            .handlers
            .get(id)
            .ok_or_else(|| BrgyError::Scheduler(format!("job '{id}' has no handler")))?
            .clone();

        job.state = JobState::Running;
        job.last_run = Some(now);
        job.run_count += 1;
        Ok(DueJob {
            id: job.id.clone(),
            name: job.name.clone(),
            started_at: now,
            handler,
        })
    }

    /// Record the outcome of a run started by [`take_due`](Self::take_due)
    /// or [`trigger_now`](Self::trigger_now).
    pub fn finish(&mut self, due: &DueJob, finished_at: DateTime<Utc>, result: &Result<String>) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == due.id) {
            let exhausted = matches!(job.trigger, Trigger::Once { .. }) && job.next_run.is_none();
            job.state = if !job.enabled || exhausted {
                JobState::Disabled
            } else {
                JobState::Idle
            };
            job.last_error = result.as_ref().err().map(|e| e.to_string());
        }

        let (ok, message) = match result {
            Ok(summary) => (true, summary.clone()),
            Err(e) => (false, e.to_string()),
        };
        self.history.record(JobRun {
            job_id: due.id.clone(),
            job_name: due.name.clone(),
            started_at: due.started_at,
            finished_at,
            ok,
            message,
        });
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Get job count.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// Execute one due job and report back to the engine.
pub async fn run_job(engine: Arc<Mutex<SchedulerEngine>>, due: DueJob) {
    let result = due.execute().await;
    match &result {
        Ok(summary) => tracing::info!("Job '{}' finished: {}", due.name, summary),
        Err(e) => tracing::warn!("Job '{}' failed: {e}", due.name),
    }
    engine.lock().await.finish(&due, Utc::now(), &result);
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the timer loop. In-flight jobs are not awaited.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!("Scheduler loop ended abnormally: {e}");
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Spawn the scheduler loop as a background tokio task.
pub fn spawn_scheduler(
    engine: Arc<Mutex<SchedulerEngine>>,
    check_interval_secs: u64,
) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        tracing::info!("Scheduler started (check every {}s)", check_interval_secs);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due = engine.lock().await.take_due(Utc::now());
                    for job in due {
                        tokio::spawn(run_job(engine.clone(), job));
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    SchedulerHandle { shutdown, join }
}
