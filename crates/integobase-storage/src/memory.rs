use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use integobase_core::{
    Checkpoint, Entity, EntityKey, EntityKind, JobId, ParentKey, ParentRef, RunOutcome, SyncRun,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    BatchReceipt, EntityPage, EntityWrite, RunFilter, StoreError, SyncStore, ABANDONED_RUN_MESSAGE,
};

/// Process-local store used in offline mode and by the test suites.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<EntityKey, Entity>,
    runs: Vec<SyncRun>,
    checkpoints: HashMap<JobId, Checkpoint>,
    reject_all: bool,
    rejected_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any batch containing `source_id` fails as a whole until cleared.
    pub async fn reject_writes_for(&self, source_id: impl Into<String>) {
        self.state.lock().await.rejected_ids.insert(source_id.into());
    }

    pub async fn reject_all_writes(&self, reject: bool) {
        self.state.lock().await.reject_all = reject;
    }

    pub async fn clear_rejections(&self) {
        let mut state = self.state.lock().await;
        state.reject_all = false;
        state.rejected_ids.clear();
    }

    pub async fn entity_count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .await
            .entities
            .keys()
            .filter(|k| k.kind == kind)
            .count()
    }

    pub async fn all_runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.clone()
    }
}

impl MemoryState {
    fn check_writable(&self, writes: &[EntityWrite]) -> Result<(), StoreError> {
        for write in writes {
            if self.reject_all || self.rejected_ids.contains(&write.key.source_id) {
                return Err(StoreError::Write {
                    source_id: write.key.source_id.clone(),
                    detail: "write rejected by store".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or(StoreError::RunNotFound(run.id))?;
        if stored.outcome != RunOutcome::Running {
            return Err(StoreError::RunFinalized(run.id));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn load_checkpoint(&self, job: JobId) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.state.lock().await.checkpoints.get(&job).cloned())
    }

    async fn save_checkpoint(&self, job: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .checkpoints
            .insert(job, checkpoint.clone());
        Ok(())
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        Ok(self.state.lock().await.entities.get(key).cloned())
    }

    async fn resolve_parent(&self, parent: &ParentRef) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let id = match &parent.key {
            ParentKey::SourceId(source_id) => state
                .entities
                .get(&EntityKey::new(parent.source, parent.kind, source_id.clone()))
                .map(|e| e.id),
            ParentKey::NaturalKey(natural) => state
                .entities
                .values()
                .find(|e| {
                    e.key.source == parent.source
                        && e.key.kind == parent.kind
                        && e.natural_key.as_deref() == Some(natural.as_str())
                })
                .map(|e| e.id),
        };
        Ok(id)
    }

    async fn commit_batch(&self, writes: &[EntityWrite]) -> Result<BatchReceipt, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(writes)?;

        let now = Utc::now();
        let mut receipt = BatchReceipt::default();
        for write in writes {
            match state.entities.get_mut(&write.key) {
                Some(existing) => {
                    existing.parent_id = write.parent_id;
                    existing.natural_key = write.natural_key.clone();
                    existing.source_modified_at = write.source_modified_at;
                    existing.content_hash = write.content_hash.clone();
                    existing.fields = write.fields.clone();
                    existing.version += 1;
                    existing.updated_at = now;
                    receipt.updated += 1;
                }
                None => {
                    let entity = Entity {
                        id: Uuid::new_v4(),
                        key: write.key.clone(),
                        parent_id: write.parent_id,
                        natural_key: write.natural_key.clone(),
                        source_modified_at: write.source_modified_at,
                        content_hash: write.content_hash.clone(),
                        version: 1,
                        fields: write.fields.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    state.entities.insert(write.key.clone(), entity);
                    receipt.created += 1;
                }
            }
        }
        Ok(receipt)
    }

    async fn get_entity_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .entities
            .values()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        offset: u64,
        limit: u64,
    ) -> Result<EntityPage, StoreError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Entity> =
            state.entities.values().filter(|e| e.key.kind == kind).collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.source_id.cmp(&b.key.source_id))
        });
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(EntityPage {
            items,
            total,
            offset,
            limit,
        })
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<SyncRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<SyncRun> = state
            .runs
            .iter()
            .filter(|r| filter.job.map_or(true, |job| r.job == job))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(filter.limit as usize);
        Ok(runs)
    }

    async fn latest_runs(&self) -> Result<Vec<SyncRun>, StoreError> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<JobId, &SyncRun> = BTreeMap::new();
        for run in &state.runs {
            match latest.get(&run.job) {
                Some(current) if current.started_at > run.started_at => {}
                _ => {
                    latest.insert(run.job, run);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn abandon_running_runs(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut closed = 0;
        for run in state.runs.iter_mut().filter(|r| !r.is_finalized()) {
            run.finalize(RunOutcome::Failure, Some(ABANDONED_RUN_MESSAGE.to_string()));
            closed += 1;
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use integobase_core::{ClientFields, EntityFields, RunTrigger, SiteFields, SourceKind};

    fn client_write(id: &str, name: &str, account: &str) -> EntityWrite {
        EntityWrite {
            key: EntityKey::new(SourceKind::Helpdesk, EntityKind::Client, id),
            parent_id: None,
            natural_key: Some(account.to_string()),
            source_modified_at: None,
            content_hash: format!("hash-{name}"),
            fields: EntityFields::Client(ClientFields {
                name: name.to_string(),
                account_number: account.to_string(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_entity_per_key() {
        let store = MemoryStore::new();
        let first = store.commit_batch(&[client_write("7", "Acme", "A-1")]).await.unwrap();
        let second = store.commit_batch(&[client_write("7", "Acme Ltd", "A-1")]).await.unwrap();

        assert_eq!(first, BatchReceipt { created: 1, updated: 0 });
        assert_eq!(second, BatchReceipt { created: 0, updated: 1 });
        assert_eq!(store.entity_count(EntityKind::Client).await, 1);

        let key = EntityKey::new(SourceKind::Helpdesk, EntityKind::Client, "7");
        let entity = store.get_entity(&key).await.unwrap().unwrap();
        assert_eq!(entity.version, 2);
        assert_eq!(entity.fields.display_name(), "Acme Ltd");
    }

    #[tokio::test]
    async fn rejected_batch_applies_nothing() {
        let store = MemoryStore::new();
        store.reject_writes_for("9").await;
        let err = store
            .commit_batch(&[client_write("8", "Ok", "A-8"), client_write("9", "Bad", "A-9")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Write { ref source_id, .. } if source_id == "9"));
        assert_eq!(store.entity_count(EntityKind::Client).await, 0);
    }

    #[tokio::test]
    async fn parents_resolve_by_source_id_and_natural_key() {
        let store = MemoryStore::new();
        store.commit_batch(&[client_write("7", "Acme", "A-1")]).await.unwrap();
        let client_id = store
            .get_entity(&EntityKey::new(SourceKind::Helpdesk, EntityKind::Client, "7"))
            .await
            .unwrap()
            .unwrap()
            .id;

        let by_id = ParentRef::by_source_id(SourceKind::Helpdesk, EntityKind::Client, "7");
        let by_account = ParentRef::by_natural_key(SourceKind::Helpdesk, EntityKind::Client, "A-1");
        let missing = ParentRef::by_natural_key(SourceKind::Helpdesk, EntityKind::Client, "A-404");

        assert_eq!(store.resolve_parent(&by_id).await.unwrap(), Some(client_id));
        assert_eq!(store.resolve_parent(&by_account).await.unwrap(), Some(client_id));
        assert_eq!(store.resolve_parent(&missing).await.unwrap(), None);

        let site = EntityWrite {
            key: EntityKey::new(SourceKind::Rmm, EntityKind::Site, "site-1"),
            parent_id: Some(client_id),
            natural_key: None,
            source_modified_at: None,
            content_hash: "h".into(),
            fields: EntityFields::Site(SiteFields {
                name: "HQ".into(),
                account_number: Some("A-1".into()),
                portal_url: None,
            }),
        };
        store.commit_batch(&[site]).await.unwrap();
        let page = store.list_entities(EntityKind::Site, 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].parent_id, Some(client_id));
    }

    #[tokio::test]
    async fn finalized_runs_are_immutable() {
        let store = MemoryStore::new();
        let mut run = SyncRun::open(
            JobId::new(SourceKind::Helpdesk, EntityKind::Client),
            RunTrigger::Scheduled,
        );
        store.begin_run(&run).await.unwrap();
        run.finalize(RunOutcome::Success, None);
        store.finish_run(&run).await.unwrap();

        run.message = Some("late edit".into());
        let err = store.finish_run(&run).await.unwrap_err();
        assert!(matches!(err, StoreError::RunFinalized(id) if id == run.id));

        let latest = store.latest_runs().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].message, None);
    }

    #[tokio::test]
    async fn abandoned_running_runs_are_closed_as_failures() {
        let store = MemoryStore::new();
        let job = JobId::new(SourceKind::Rmm, EntityKind::Asset);
        let mut done = SyncRun::open(job, RunTrigger::Scheduled);
        store.begin_run(&done).await.unwrap();
        done.finalize(RunOutcome::Success, None);
        store.finish_run(&done).await.unwrap();
        let stuck = SyncRun::open(job, RunTrigger::Scheduled);
        store.begin_run(&stuck).await.unwrap();

        assert_eq!(store.abandon_running_runs().await.unwrap(), 1);
        assert_eq!(store.abandon_running_runs().await.unwrap(), 0);

        let runs = store.all_runs().await;
        let closed = runs.iter().find(|r| r.id == stuck.id).unwrap();
        assert_eq!(closed.outcome, RunOutcome::Failure);
        assert!(closed.finished_at.is_some());
        assert_eq!(runs.iter().find(|r| r.id == done.id).unwrap().outcome, RunOutcome::Success);
        assert!(matches!(
            store.finish_run(&stuck).await,
            Err(StoreError::RunFinalized(_))
        ));
    }
}
