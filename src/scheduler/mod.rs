//! Timer-driven job dispatcher.
//!
//! Each registered job ticks on its own cadence in its own task. A run is
//! guarded by a per-job in-flight flag: a tick that arrives while the
//! previous run is still going is skipped. Every completed run (success or
//! error) is appended to `cron_execution_logs`; failures never stop the
//! scheduler or other jobs.
//!
//! Shutdown: cancelling the token passed to [`Scheduler::run_until`] stops
//! all tick loops at once. In-flight runs get `shutdown_grace` to finish and
//! are then cancelled (recorded as errors).

mod cadence;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfheal_common::CronStatus;
use selfheal_common::time::format_ts;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::errors::PipelineError;
use crate::store::DbHandle;

pub use cadence::{Cadence, CronSchedule};

/// A named unit of periodic work. `run` returns a one-line summary that is
/// stored with the execution log.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> anyhow::Result<String>;
}

/// Result of one guarded run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub job: String,
    pub status: CronStatus,
    pub message: String,
    pub duration_ms: i64,
    pub executed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub cadence: String,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
}

struct ScheduledJob {
    job: Arc<dyn Job>,
    cadence: Cadence,
    running: AtomicBool,
}

/// Clears the in-flight flag when the run ends, including on panic or
/// cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    jobs: Vec<Arc<ScheduledJob>>,
    db: DbHandle,
    store_timeout: Duration,
    shutdown_grace: Duration,
    /// Fired after the grace period to cancel runs that are still going.
    abort: CancellationToken,
    runs: TaskTracker,
}

impl Scheduler {
    pub fn new(db: DbHandle, store_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            db,
            store_timeout,
            shutdown_grace,
            abort: CancellationToken::new(),
            runs: TaskTracker::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>, cadence: Cadence) {
        tracing::debug!(job = job.name(), cadence = %cadence, "registered job");
        self.jobs.push(Arc::new(ScheduledJob {
            job,
            cadence,
            running: AtomicBool::new(false),
        }));
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        self.jobs
            .iter()
            .map(|entry| JobInfo {
                name: entry.job.name().to_string(),
                cadence: entry.cadence.to_string(),
                next_run: entry.cadence.next_after(now),
                running: entry.running.load(Ordering::Acquire),
            })
            .collect()
    }

    fn find(&self, name: &str) -> Result<&Arc<ScheduledJob>, PipelineError> {
        self.jobs
            .iter()
            .find(|entry| entry.job.name() == name)
            .ok_or_else(|| PipelineError::UnknownJob {
                name: name.to_string(),
            })
    }

    /// Run a job once, now, through the same in-flight guard as scheduled
    /// ticks. `Ok(None)` means the job was already running.
    pub async fn trigger(&self, name: &str) -> Result<Option<RunOutcome>, PipelineError> {
        let entry = self.find(name)?.clone();
        Ok(self.run_guarded(&entry).await)
    }

    async fn run_guarded(&self, entry: &ScheduledJob) -> Option<RunOutcome> {
        let name = entry.job.name().to_string();
        let Some(_in_flight) = InFlight::acquire(&entry.running) else {
            tracing::warn!(job = %name, "previous run still in flight, skipping tick");
            return None;
        };

        let span = tracing::info_span!("job", job = %name);
        let outcome = self.execute(entry).instrument(span.clone()).await;
        self.record(&outcome).instrument(span).await;
        Some(outcome)
    }

    async fn execute(&self, entry: &ScheduledJob) -> RunOutcome {
        let executed_at = format_ts(Utc::now());
        let started = Instant::now();
        let result = tokio::select! {
            result = entry.job.run() => result,
            _ = self.abort.cancelled() => Err(anyhow::anyhow!("cancelled during shutdown")),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, message) = match result {
            Ok(summary) => {
                tracing::info!(duration_ms, "{}", summary);
                (CronStatus::Success, summary)
            }
            Err(e) => {
                tracing::error!(duration_ms, error = %format!("{:#}", e), "job failed");
                (CronStatus::Error, format!("{:#}", e))
            }
        };
        RunOutcome {
            job: entry.job.name().to_string(),
            status,
            message,
            duration_ms,
            executed_at,
        }
    }

    async fn record(&self, outcome: &RunOutcome) {
        let o = outcome.clone();
        let recorded = self
            .db
            .call_with_timeout("record_cron_execution", self.store_timeout, move |db| {
                db.record_cron_execution(&o.job, o.status, Some(&o.message), o.duration_ms, &o.executed_at)
            })
            .await;
        if let Err(e) = recorded {
            tracing::warn!(error = %e, "failed to record cron execution");
        }
    }

    /// Tick every registered job on its cadence until `shutdown` fires, then
    /// drain in-flight runs within the grace period.
    pub async fn run_until(self: Arc<Self>, shutdown: CancellationToken) {
        let loops = TaskTracker::new();
        for entry in &self.jobs {
            let this = self.clone();
            let entry = entry.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { this.tick_loop(entry, shutdown).await });
        }
        loops.close();
        tracing::info!(jobs = self.jobs.len(), "scheduler started");

        loops.wait().await;
        self.runs.close();
        if tokio::time::timeout(self.shutdown_grace, self.runs.wait()).await.is_err() {
            tracing::warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "in-flight jobs did not finish within the grace period, cancelling"
            );
            self.abort.cancel();
            self.runs.wait().await;
        }
        tracing::info!("scheduler stopped");
    }

    async fn tick_loop(self: Arc<Self>, entry: Arc<ScheduledJob>, shutdown: CancellationToken) {
        loop {
            let now = Utc::now();
            let Some(next) = entry.cadence.next_after(now) else {
                tracing::warn!(job = entry.job.name(), "cadence never fires again");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            // Runs are detached from the tick loop so that a long run meets
            // the in-flight guard on the next tick instead of delaying it.
            let this = self.clone();
            let entry = entry.clone();
            self.runs.spawn(async move {
                this.run_guarded(&entry).await;
            });
        }
    }
}
