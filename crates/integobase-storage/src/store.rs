use async_trait::async_trait;
use chrono::{DateTime, Utc};
use integobase_core::{
    Checkpoint, Entity, EntityFields, EntityKey, EntityKind, JobId, ParentRef, SyncRun,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write rejected for `{source_id}`: {detail}")]
    Write { source_id: String, detail: String },
    #[error("sync run {0} is already finalized")]
    RunFinalized(Uuid),
    #[error("sync run {0} does not exist")]
    RunNotFound(Uuid),
    #[error("database error: {0}")]
    Database(String),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// One reconciled record ready to be upserted by key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub key: EntityKey,
    pub parent_id: Option<Uuid>,
    pub natural_key: Option<String>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub fields: EntityFields,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    pub created: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityPage {
    pub items: Vec<Entity>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RunFilter {
    pub job: Option<JobId>,
    pub limit: u64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            job: None,
            limit: 50,
        }
    }
}

/// Transactional persistence contract shared by the sync engine and the read
/// API. Implementations must enforce at most one entity per [`EntityKey`].
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Persists a freshly opened run.
    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Writes the final state of a run. Fails with [`StoreError::RunFinalized`]
    /// if the stored run already left `Running`.
    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, job: JobId) -> Result<Option<Checkpoint>, StoreError>;

    async fn save_checkpoint(&self, job: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError>;

    /// Local id of the entity a parent reference points at, if it exists yet.
    async fn resolve_parent(&self, parent: &ParentRef) -> Result<Option<Uuid>, StoreError>;

    /// Upserts every write in one transaction; on error nothing is applied.
    async fn commit_batch(&self, writes: &[EntityWrite]) -> Result<BatchReceipt, StoreError>;

    async fn get_entity_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError>;

    async fn list_entities(
        &self,
        kind: EntityKind,
        offset: u64,
        limit: u64,
    ) -> Result<EntityPage, StoreError>;

    /// Run history, most recent first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<SyncRun>, StoreError>;

    /// Most recent run of every job that has run at least once.
    async fn latest_runs(&self) -> Result<Vec<SyncRun>, StoreError>;

    /// Finalizes every run still `Running` as a failure. Only safe while no
    /// job is executing against this store. Returns how many were closed.
    async fn abandon_running_runs(&self) -> Result<u64, StoreError>;
}

pub(crate) const ABANDONED_RUN_MESSAGE: &str = "abandoned: process stopped before the run finished";
