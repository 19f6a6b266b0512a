//! Dependency-ordered execution of sync jobs for one cycle.
//!
//! Jobs are grouped into layers: every job's declared dependencies sit in an
//! earlier layer. Layers run one after another; jobs inside a layer run
//! concurrently. A failed parent never stops its dependents from running,
//! except that a source which rejects our credentials is halted: its
//! remaining jobs are not started until a manual trigger or a restart.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use integobase_core::{JobId, RunCounts, RunOutcome, RunTrigger, SourceKind, SyncRun};
use integobase_storage::{StoreError, SyncStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{self, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, SyncRegistry};
use crate::job::{JobReport, SyncJob};

/// Orders the registry's enabled jobs into dependency layers.
///
/// Dependencies on declared but disabled jobs are ignored; dependencies on
/// undeclared jobs, cycles and duplicate declarations are rejected.
pub fn plan(registry: &SyncRegistry) -> Result<Vec<Vec<JobId>>, ConfigError> {
    let mut declared = HashSet::new();
    for job in &registry.jobs {
        if !job.source.entity_kinds().contains(&job.kind) {
            return Err(ConfigError::UnsupportedJob {
                source_kind: job.source,
                kind: job.kind,
            });
        }
        if !declared.insert(job.id()) {
            return Err(ConfigError::DuplicateJob(job.id()));
        }
    }

    let enabled: BTreeSet<JobId> = registry.enabled_jobs().map(|j| j.id()).collect();
    let mut parents: BTreeMap<JobId, BTreeSet<JobId>> = BTreeMap::new();
    for job in registry.enabled_jobs() {
        let mut deps = BTreeSet::new();
        for raw in &job.after {
            let dependency: JobId = raw
                .parse()
                .ok()
                .filter(|id| declared.contains(id))
                .ok_or_else(|| ConfigError::UnknownDependency {
                    job: job.id(),
                    dependency: raw.clone(),
                })?;
            if dependency == job.id() {
                return Err(ConfigError::Cycle(job.id().to_string()));
            }
            if enabled.contains(&dependency) {
                deps.insert(dependency);
            }
        }
        parents.insert(job.id(), deps);
    }

    let mut layers = Vec::new();
    let mut placed: BTreeSet<JobId> = BTreeSet::new();
    while placed.len() < parents.len() {
        let layer: Vec<JobId> = parents
            .iter()
            .filter(|(id, deps)| !placed.contains(*id) && deps.is_subset(&placed))
            .map(|(id, _)| *id)
            .collect();
        if layer.is_empty() {
            let stuck: Vec<String> = parents
                .keys()
                .filter(|id| !placed.contains(*id))
                .map(JobId::to_string)
                .collect();
            return Err(ConfigError::Cycle(stuck.join(", ")));
        }
        placed.extend(layer.iter().copied());
        layers.push(layer);
    }
    Ok(layers)
}

#[derive(Debug, Error)]
pub enum RunJobError {
    #[error("no sync job registered for {0}")]
    UnknownJob(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Ran {
        run_id: Uuid,
        outcome: RunOutcome,
        counts: RunCounts,
        message: Option<String>,
    },
    /// Ran more recently than its own interval allows.
    NotDue { next_due: DateTime<Utc> },
    /// Not started because its source rejected our credentials.
    Halted { source: SourceKind },
    /// The run record could not be written or the task died.
    Errored { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleEntry {
    pub job: JobId,
    pub layer: usize,
    #[serde(flatten)]
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<CycleEntry>,
}

impl CycleReport {
    pub fn entry(&self, job: JobId) -> Option<&CycleEntry> {
        self.entries.iter().find(|e| e.job == job)
    }

    pub fn outcome_of(&self, job: JobId) -> Option<RunOutcome> {
        match &self.entry(job)?.status {
            EntryStatus::Ran { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

pub struct Sequencer {
    layers: Vec<Vec<JobId>>,
    jobs: BTreeMap<JobId, Arc<SyncJob>>,
    intervals: HashMap<JobId, Duration>,
    store: Arc<dyn SyncStore>,
    /// Sources whose credentials were rejected. Cleared by manual triggers.
    halted: Mutex<HashSet<SourceKind>>,
}

impl Sequencer {
    /// Layers naming a job with no matching [`SyncJob`] are skipped with a
    /// warning at cycle time.
    pub fn new(layers: Vec<Vec<JobId>>, jobs: Vec<SyncJob>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            layers,
            jobs: jobs.into_iter().map(|j| (j.id(), Arc::new(j))).collect(),
            intervals: HashMap::new(),
            store,
            halted: Mutex::new(HashSet::new()),
        }
    }

    /// Per-job minimum spacing, honored by scheduled cycles only.
    pub fn with_interval(mut self, job: JobId, interval: Duration) -> Self {
        self.intervals.insert(job, interval);
        self
    }

    pub fn layers(&self) -> &[Vec<JobId>] {
        &self.layers
    }

    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.keys().copied()
    }

    pub fn store(&self) -> Arc<dyn SyncStore> {
        Arc::clone(&self.store)
    }

    pub async fn halted_sources(&self) -> Vec<SourceKind> {
        let mut sources: Vec<SourceKind> = self.halted.lock().await.iter().copied().collect();
        sources.sort();
        sources
    }

    async fn halt(&self, source: SourceKind) {
        if self.halted.lock().await.insert(source) {
            error!(
                source = source.as_str(),
                "credentials rejected; halting this source's jobs until the configuration is fixed"
            );
        }
    }

    async fn resume(&self, sources: &[SourceKind]) {
        let mut halted = self.halted.lock().await;
        for source in sources {
            if halted.remove(source) {
                info!(source = source.as_str(), "manual trigger resumes halted source");
            }
        }
    }

    pub async fn run_cycle(&self, trigger: RunTrigger) -> CycleReport {
        let started_at = Utc::now();
        info!(trigger = trigger.as_str(), layers = self.layers.len(), "sync cycle started");
        if trigger == RunTrigger::Manual {
            self.resume(&SourceKind::ALL).await;
        }

        let last_runs = if trigger == RunTrigger::Scheduled && !self.intervals.is_empty() {
            match self.store.latest_runs().await {
                Ok(runs) => runs.into_iter().map(|r| (r.job, r)).collect(),
                Err(err) => {
                    warn!(error = %err, "could not read run history; every job treated as due");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut entries = Vec::new();
        for (layer_no, layer) in self.layers.iter().enumerate() {
            let halted = self.halted.lock().await.clone();
            let mut tasks = JoinSet::new();
            let mut running: HashMap<task::Id, JobId> = HashMap::new();
            for id in layer {
                let Some(job) = self.jobs.get(id) else {
                    warn!(job = %id, "planned job has no client; skipping");
                    continue;
                };
                if halted.contains(&id.source) {
                    warn!(job = %id, "source halted after rejected credentials; job not started");
                    entries.push(CycleEntry {
                        job: *id,
                        layer: layer_no,
                        status: EntryStatus::Halted { source: id.source },
                    });
                    continue;
                }
                if let Some(next_due) = self.next_due(*id, last_runs.get(id), started_at) {
                    info!(job = %id, %next_due, "job not due yet");
                    entries.push(CycleEntry {
                        job: *id,
                        layer: layer_no,
                        status: EntryStatus::NotDue { next_due },
                    });
                    continue;
                }
                let job = Arc::clone(job);
                let handle = tasks.spawn(async move { (job.id(), job.execute(trigger).await) });
                running.insert(handle.id(), *id);
            }

            let mut layer_entries = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let (job, status) = match joined {
                    Ok((job, Ok(report))) => {
                        if report.auth_failed {
                            self.halt(job.source).await;
                        }
                        (job, ran(&report))
                    }
                    Ok((job, Err(err))) => {
                        error!(job = %job, error = %err, "run bookkeeping failed");
                        (
                            job,
                            EntryStatus::Errored {
                                detail: err.to_string(),
                            },
                        )
                    }
                    Err(err) => {
                        let Some(job) = running.get(&err.id()).copied() else {
                            error!(error = %err, "untracked sync job task aborted");
                            continue;
                        };
                        error!(job = %job, error = %err, "sync job task aborted");
                        let detail = if err.is_panic() {
                            "job task panicked".to_string()
                        } else {
                            "job task was cancelled".to_string()
                        };
                        (job, EntryStatus::Errored { detail })
                    }
                };
                layer_entries.push(CycleEntry {
                    job,
                    layer: layer_no,
                    status,
                });
            }
            layer_entries.sort_by_key(|e| e.job);
            entries.extend(layer_entries);
        }

        let finished_at = Utc::now();
        info!(
            trigger = trigger.as_str(),
            jobs = entries.len(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "sync cycle finished"
        );
        CycleReport {
            trigger,
            started_at,
            finished_at,
            entries,
        }
    }

    /// Runs a single job outside the layered cycle. Interval spacing does
    /// not apply, and a manual run lifts a halt on the job's source.
    pub async fn run_job(&self, id: JobId, trigger: RunTrigger) -> Result<SyncRun, RunJobError> {
        let job = self.jobs.get(&id).ok_or(RunJobError::UnknownJob(id))?;
        if trigger == RunTrigger::Manual {
            self.resume(&[id.source]).await;
        }
        let report = job.execute(trigger).await?;
        if report.auth_failed {
            self.halt(id.source).await;
        }
        Ok(report.run)
    }

    fn next_due(&self, id: JobId, last: Option<&SyncRun>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(*self.intervals.get(&id)?).ok()?;
        let last = last?;
        // Failed runs are retried on the next cycle.
        if last.outcome == RunOutcome::Failure {
            return None;
        }
        let next_due = last.started_at + interval;
        (next_due > now).then_some(next_due)
    }
}

fn ran(report: &JobReport) -> EntryStatus {
    EntryStatus::Ran {
        run_id: report.run.id,
        outcome: report.run.outcome,
        counts: report.run.counts,
        message: report.run.message.clone(),
    }
}
