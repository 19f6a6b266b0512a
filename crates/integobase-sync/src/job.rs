use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use integobase_adapters::{Pager, SourceClient, SourceError};
use integobase_core::{
    next_watermark, Checkpoint, EntityKey, EntityKind, JobId, ParentKey, ParentRef, RecordError,
    RecordErrorKind, RunOutcome, RunTrigger, SyncRun,
};
use integobase_storage::{EntityWrite, StoreError, SyncStore};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::reconcile::{Decision, Reconciler};
use crate::schema::EntityDraft;

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    /// Upper bound on writes committed in one transaction.
    pub batch_size: usize,
    pub error_sample_limit: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            error_sample_limit: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub run: SyncRun,
    /// The source refused our credentials; the sequencer halts the source.
    pub auth_failed: bool,
}

/// One synchronizable (source, kind) pair wired to its client and store.
pub struct SyncJob {
    id: JobId,
    client: Arc<dyn SourceClient>,
    store: Arc<dyn SyncStore>,
    options: JobOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

enum Abort {
    Source(SourceError),
    Store(StoreError),
}

#[derive(Default)]
struct Pass {
    max_seen: Option<DateTime<Utc>>,
    held_back: Option<DateTime<Utc>>,
    /// A batch failed to persist; the previous watermark stays in place.
    pinned: bool,
    cancelled: bool,
}

impl Pass {
    fn see(&mut self, at: Option<DateTime<Utc>>) {
        self.max_seen = self.max_seen.max(at);
    }

    fn hold_back(&mut self, at: Option<DateTime<Utc>>) {
        if let Some(at) = at {
            self.held_back = Some(self.held_back.map_or(at, |held| held.min(at)));
        }
    }
}

/// Uncommitted writes, collapsed by key so a record delivered twice in one
/// run is written once with its latest content.
#[derive(Default)]
struct WriteBuffer {
    writes: Vec<EntityWrite>,
    index: HashMap<EntityKey, usize>,
}

impl WriteBuffer {
    fn push(&mut self, write: EntityWrite) {
        match self.index.get(&write.key) {
            Some(&slot) => self.writes[slot] = write,
            None => {
                self.index.insert(write.key.clone(), self.writes.len());
                self.writes.push(write);
            }
        }
    }

    fn len(&self) -> usize {
        self.writes.len()
    }

    fn take(&mut self) -> Vec<EntityWrite> {
        self.index.clear();
        std::mem::take(&mut self.writes)
    }
}

impl SyncJob {
    pub fn new(
        client: Arc<dyn SourceClient>,
        store: Arc<dyn SyncStore>,
        kind: EntityKind,
        options: JobOptions,
    ) -> Self {
        Self {
            id: JobId::new(client.source(), kind),
            client,
            store,
            options,
            shutdown: None,
        }
    }

    /// Cancellation is observed between pages and after each committed batch.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn run(&self, trigger: RunTrigger) -> Result<SyncRun, StoreError> {
        Ok(self.execute(trigger).await?.run)
    }

    /// Executes one run. Source and processing failures are captured in the
    /// returned run; `Err` means the run record itself could not be kept.
    pub async fn execute(&self, trigger: RunTrigger) -> Result<JobReport, StoreError> {
        let mut run = SyncRun::open(self.id, trigger);
        self.store.begin_run(&run).await?;

        let span = info_span!("sync_job", job = %self.id, run_id = %run.id);
        let auth_failed = self.drive(&mut run, trigger).instrument(span).await?;
        Ok(JobReport { run, auth_failed })
    }

    /// Everything between opening and persisting the final run record.
    /// Returns whether the source rejected our credentials.
    async fn drive(&self, run: &mut SyncRun, trigger: RunTrigger) -> Result<bool, StoreError> {
        info!(trigger = trigger.as_str(), "sync run started");
        let mut auth_failed = false;

        let checkpoint = match self.store.load_checkpoint(self.id).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(error = %err, "could not load checkpoint");
                run.finalize(RunOutcome::Failure, Some(format!("loading checkpoint: {err}")));
                self.store.finish_run(run).await?;
                return Ok(auth_failed);
            }
        };
        run.checkpoint_before = checkpoint.clone();

        match self.process(run, checkpoint.as_ref()).await {
            Ok(pass) => self.settle(run, checkpoint.as_ref(), pass).await,
            Err(Abort::Source(err)) => {
                auth_failed = err.is_auth();
                error!(error = %err, "source fetch failed; checkpoint left untouched");
                run.finalize(RunOutcome::Failure, Some(err.to_string()));
            }
            Err(Abort::Store(err)) => {
                error!(error = %err, "store read failed; checkpoint left untouched");
                run.finalize(RunOutcome::Failure, Some(err.to_string()));
            }
        }

        self.store.finish_run(run).await?;
        info!(
            outcome = run.outcome.as_str(),
            fetched = run.counts.fetched,
            created = run.counts.created,
            updated = run.counts.updated,
            unchanged = run.counts.unchanged,
            deferred = run.counts.deferred,
            skipped = run.counts.skipped,
            invalid = run.counts.invalid,
            failed = run.counts.failed,
            "sync run finished"
        );
        Ok(auth_failed)
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn process(&self, run: &mut SyncRun, checkpoint: Option<&Checkpoint>) -> Result<Pass, Abort> {
        let mut pass = Pass::default();
        let mut pager = Pager::new(self.client.as_ref(), self.id.kind, checkpoint.cloned());
        let mut reconciler = Reconciler::new(self.store.as_ref());
        let mut buffer = WriteBuffer::default();
        let mut deferred: Vec<EntityDraft> = Vec::new();

        loop {
            if self.cancelled() {
                pass.cancelled = true;
                break;
            }
            let Some(page) = pager.next_page().await.map_err(Abort::Source)? else {
                break;
            };
            debug!(page = pager.pages_fetched(), records = page.records.len(), "page fetched");

            for record in &page.records {
                run.counts.fetched += 1;
                pass.see(record.modified_at);
                let decision = reconciler.reconcile(record).await.map_err(Abort::Store)?;
                self.apply(run, decision, &mut buffer, &mut deferred);
                if buffer.len() >= self.options.batch_size {
                    self.flush(run, &mut pass, &mut reconciler, &mut buffer).await;
                    if self.cancelled() {
                        pass.cancelled = true;
                        break;
                    }
                }
            }
            if pass.cancelled {
                break;
            }
        }
        self.flush(run, &mut pass, &mut reconciler, &mut buffer).await;

        // Parents committed earlier in this run may now resolve.
        if !pass.cancelled && !deferred.is_empty() {
            debug!(count = deferred.len(), "retrying deferred records");
            let mut still_deferred = Vec::new();
            for draft in std::mem::take(&mut deferred) {
                match reconciler.reconcile_draft(draft).await.map_err(Abort::Store)? {
                    Decision::Deferred(draft) => still_deferred.push(draft),
                    other => {
                        let mut ignored = Vec::new();
                        self.apply(run, other, &mut buffer, &mut ignored);
                    }
                }
                if buffer.len() >= self.options.batch_size {
                    self.flush(run, &mut pass, &mut reconciler, &mut buffer).await;
                }
            }
            self.flush(run, &mut pass, &mut reconciler, &mut buffer).await;
            deferred = still_deferred;
        }

        let incremental = self.client.incremental(self.id.kind);
        for draft in deferred {
            run.counts.skipped += 1;
            pass.hold_back(draft.modified_at);
            let parent = draft.parent.as_ref().map(describe_parent).unwrap_or_default();
            if incremental {
                warn!(source_id = %draft.key.source_id, parent = %parent, "parent unresolved; held back for the next cycle");
            } else {
                warn!(source_id = %draft.key.source_id, parent = %parent, "parent unresolved; record skipped until it is re-fetched");
            }
            run.sample_error(
                RecordError {
                    source_id: Some(draft.key.source_id),
                    kind: RecordErrorKind::Unresolved,
                    detail: format!("parent {parent} not present locally"),
                },
                self.options.error_sample_limit,
            );
        }

        Ok(pass)
    }

    fn apply(
        &self,
        run: &mut SyncRun,
        decision: Decision,
        buffer: &mut WriteBuffer,
        deferred: &mut Vec<EntityDraft>,
    ) {
        match decision {
            Decision::Create(write) | Decision::Update(write) => buffer.push(write),
            Decision::Unchanged => run.counts.unchanged += 1,
            Decision::Deferred(draft) => {
                run.counts.deferred += 1;
                deferred.push(draft);
            }
            Decision::Invalid(err) => {
                run.counts.invalid += 1;
                warn!(source_id = err.source_id.as_deref().unwrap_or("-"), reason = %err.detail, "invalid record");
                run.sample_error(err, self.options.error_sample_limit);
            }
        }
    }

    /// Commits the open batch. A rejected batch is rolled back whole, counted
    /// as failed and pins the checkpoint to its value before the run.
    async fn flush(
        &self,
        run: &mut SyncRun,
        pass: &mut Pass,
        reconciler: &mut Reconciler<'_>,
        buffer: &mut WriteBuffer,
    ) {
        if buffer.len() == 0 {
            return;
        }
        let writes = buffer.take();
        match self.store.commit_batch(&writes).await {
            Ok(receipt) => {
                run.counts.created += receipt.created;
                run.counts.updated += receipt.updated;
                debug!(created = receipt.created, updated = receipt.updated, "batch committed");
            }
            Err(err) => {
                error!(error = %err, size = writes.len(), "batch rejected");
                run.counts.failed += writes.len() as u64;
                reconciler.forget(writes.iter().map(|w| &w.key));
                pass.pinned = true;
                for write in &writes {
                    run.sample_error(
                        RecordError {
                            source_id: Some(write.key.source_id.clone()),
                            kind: RecordErrorKind::StoreWrite,
                            detail: err.to_string(),
                        },
                        self.options.error_sample_limit,
                    );
                }
            }
        }
    }

    async fn settle(&self, run: &mut SyncRun, previous: Option<&Checkpoint>, pass: Pass) {
        if pass.cancelled {
            warn!("shutdown requested; run stopped early, checkpoint left untouched");
            run.finalize(RunOutcome::Partial, Some("cancelled by shutdown".to_string()));
            return;
        }

        if pass.pinned {
            warn!(failed = run.counts.failed, "batch commit failed; checkpoint left untouched");
            run.checkpoint_after = previous.cloned();
        } else {
            let checkpoint = Checkpoint {
                watermark: next_watermark(previous.and_then(|c| c.watermark), pass.max_seen, pass.held_back),
                page_token: None,
                updated_at: Utc::now(),
            };
            if let Err(err) = self.store.save_checkpoint(self.id, &checkpoint).await {
                error!(error = %err, "checkpoint save failed");
                run.finalize(RunOutcome::Failure, Some(format!("saving checkpoint: {err}")));
                return;
            }
            run.checkpoint_after = Some(checkpoint);
        }

        let outcome = run.counts.settled_outcome();
        let message = (outcome == RunOutcome::Partial).then(|| {
            format!(
                "{} invalid, {} failed, {} unresolved",
                run.counts.invalid, run.counts.failed, run.counts.skipped
            )
        });
        run.finalize(outcome, message);
    }
}

fn describe_parent(parent: &ParentRef) -> String {
    match &parent.key {
        ParentKey::SourceId(id) => format!("{}/{} `{id}`", parent.source, parent.kind),
        ParentKey::NaturalKey(key) => format!("{}/{} with key `{key}`", parent.source, parent.kind),
    }
}
