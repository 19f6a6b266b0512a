//! Fixed-cadence cycle trigger with a single in-flight guard.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use integobase_core::{JobId, RunTrigger, SyncRun};
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::sequencer::{CycleReport, RunJobError, Sequencer};

/// What the scheduler drives. [`Sequencer`] is the production runner.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    fn has_job(&self, job: JobId) -> bool;

    async fn run_cycle(&self, trigger: RunTrigger) -> CycleReport;

    async fn run_job(&self, job: JobId, trigger: RunTrigger) -> Result<SyncRun, RunJobError>;
}

#[async_trait]
impl CycleRunner for Sequencer {
    fn has_job(&self, job: JobId) -> bool {
        self.job_ids().any(|id| id == job)
    }

    async fn run_cycle(&self, trigger: RunTrigger) -> CycleReport {
        Sequencer::run_cycle(self, trigger).await
    }

    async fn run_job(&self, job: JobId, trigger: RunTrigger) -> Result<SyncRun, RunJobError> {
        Sequencer::run_job(self, job, trigger).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub interval: Duration,
    pub run_on_start: bool,
}

struct Inner {
    runner: Arc<dyn CycleRunner>,
    options: SchedulerOptions,
    /// Held for the whole of a cycle or a manual single-job run.
    guard: Arc<Mutex<()>>,
    cron: Mutex<Option<JobScheduler>>,
    last_cycle: Mutex<Option<CycleReport>>,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; every clone shares the same guard.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// `shutdown` is the sender whose receivers were handed to the jobs.
    pub fn new(runner: Arc<dyn CycleRunner>, options: SchedulerOptions, shutdown: watch::Sender<bool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                options,
                guard: Arc::new(Mutex::new(())),
                cron: Mutex::new(None),
                last_cycle: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn options(&self) -> SchedulerOptions {
        self.inner.options
    }

    /// Registers the repeating trigger and, if configured, fires one cycle
    /// right away.
    pub async fn start(&self) -> Result<()> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_repeated_async(self.inner.options.interval, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                this.trigger_cycle(RunTrigger::Scheduled).await;
            })
        })
        .context("creating repeating sync job")?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        *self.inner.cron.lock().await = Some(sched);

        info!(
            interval_secs = self.inner.options.interval.as_secs(),
            run_on_start = self.inner.options.run_on_start,
            "scheduler started"
        );
        if self.inner.options.run_on_start {
            self.spawn_cycle(RunTrigger::Scheduled);
        }
        Ok(())
    }

    /// Runs one cycle now unless another is in flight, in which case the
    /// trigger is dropped and `None` returned.
    pub async fn trigger_cycle(&self, trigger: RunTrigger) -> Option<CycleReport> {
        let Ok(_permit) = self.inner.guard.try_lock() else {
            warn!(trigger = trigger.as_str(), "sync cycle still running; trigger skipped");
            return None;
        };
        if *self.inner.shutdown.borrow() {
            return None;
        }
        let report = self.inner.runner.run_cycle(trigger).await;
        *self.inner.last_cycle.lock().await = Some(report.clone());
        Some(report)
    }

    /// Background variant of [`Scheduler::trigger_cycle`]; `false` when the
    /// guard is taken.
    pub fn spawn_cycle(&self, trigger: RunTrigger) -> bool {
        let Ok(permit) = Arc::clone(&self.inner.guard).try_lock_owned() else {
            warn!(trigger = trigger.as_str(), "sync cycle still running; trigger skipped");
            return false;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let report = inner.runner.run_cycle(trigger).await;
            *inner.last_cycle.lock().await = Some(report);
            drop(permit);
        });
        true
    }

    /// Runs one job under the same guard as whole cycles.
    pub async fn trigger_job(&self, job: JobId) -> Option<Result<SyncRun, RunJobError>> {
        let Ok(_permit) = self.inner.guard.try_lock() else {
            warn!(job = %job, "sync cycle still running; manual job trigger skipped");
            return None;
        };
        Some(self.inner.runner.run_job(job, RunTrigger::Manual).await)
    }

    pub fn spawn_job(&self, job: JobId) -> bool {
        let Ok(permit) = Arc::clone(&self.inner.guard).try_lock_owned() else {
            warn!(job = %job, "sync cycle still running; manual job trigger skipped");
            return false;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = inner.runner.run_job(job, RunTrigger::Manual).await {
                warn!(job = %job, error = %err, "manual job run failed");
            }
            drop(permit);
        });
        true
    }

    pub fn has_job(&self, job: JobId) -> bool {
        self.inner.runner.has_job(job)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.guard.try_lock().is_err()
    }

    pub async fn last_cycle(&self) -> Option<CycleReport> {
        self.inner.last_cycle.lock().await.clone()
    }

    /// Stops new triggers, signals running jobs to stop at the next page or
    /// batch boundary, and waits for the in-flight cycle to wind down.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        if let Some(mut sched) = self.inner.cron.lock().await.take() {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        let _idle = self.inner.guard.lock().await;
        info!("scheduler stopped");
        Ok(())
    }
}
