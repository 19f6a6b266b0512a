//! Per-record diff against stored state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use integobase_core::{Entity, EntityKey, RecordError, RecordErrorKind, SourceRecord};
use integobase_storage::{EntityWrite, StoreError, SyncStore};

use crate::schema::{map_record, unique_natural_key, EntityDraft, Mapped};

/// What the reconciler compares an incoming draft against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

impl From<&Entity> for Baseline {
    fn from(entity: &Entity) -> Self {
        Self {
            modified_at: entity.source_modified_at,
            content_hash: entity.content_hash.clone(),
        }
    }
}

impl From<&EntityWrite> for Baseline {
    fn from(write: &EntityWrite) -> Self {
        Self {
            modified_at: write.source_modified_at,
            content_hash: write.content_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Create,
    Update,
    Unchanged,
}

/// Markers win when both sides carry one; otherwise content hashes decide.
pub fn classify_change(existing: Option<&Baseline>, draft: &EntityDraft) -> Change {
    let Some(existing) = existing else {
        return Change::Create;
    };
    match (draft.modified_at, existing.modified_at) {
        (Some(incoming), Some(stored)) if incoming > stored => Change::Update,
        (Some(_), Some(_)) => Change::Unchanged,
        _ if draft.content_hash != existing.content_hash => Change::Update,
        _ => Change::Unchanged,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create(EntityWrite),
    Update(EntityWrite),
    Unchanged,
    /// Parent not resolvable yet; the draft is kept for a later attempt.
    Deferred(EntityDraft),
    Invalid(RecordError),
}

/// Reconciles the records of one run. Tracks writes that are buffered but
/// not yet committed so a record delivered twice in one run diffs against
/// its own earlier version instead of the stale stored one.
pub struct Reconciler<'a> {
    store: &'a dyn SyncStore,
    pending: HashMap<EntityKey, Baseline>,
    natural_keys: HashMap<String, String>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn SyncStore) -> Self {
        Self {
            store,
            pending: HashMap::new(),
            natural_keys: HashMap::new(),
        }
    }

    pub async fn reconcile(&mut self, record: &SourceRecord) -> Result<Decision, StoreError> {
        match map_record(record) {
            Mapped::Valid(draft) => self.reconcile_draft(draft).await,
            Mapped::Invalid { source_id, reason } => Ok(Decision::Invalid(RecordError {
                source_id,
                kind: RecordErrorKind::Invalid,
                detail: reason,
            })),
        }
    }

    /// Also used for the end-of-run retry of deferred drafts.
    pub async fn reconcile_draft(&mut self, draft: EntityDraft) -> Result<Decision, StoreError> {
        if let Some(rejection) = self.claim_natural_key(&draft) {
            return Ok(Decision::Invalid(rejection));
        }

        let parent_id = match &draft.parent {
            Some(parent) => match self.store.resolve_parent(parent).await? {
                Some(id) => Some(id),
                None => return Ok(Decision::Deferred(draft)),
            },
            None => None,
        };

        let existing = match self.pending.get(&draft.key) {
            Some(buffered) => Some(buffered.clone()),
            None => self
                .store
                .get_entity(&draft.key)
                .await?
                .as_ref()
                .map(Baseline::from),
        };

        let change = classify_change(existing.as_ref(), &draft);
        if change == Change::Unchanged {
            return Ok(Decision::Unchanged);
        }

        let write = EntityWrite {
            key: draft.key,
            parent_id,
            natural_key: draft.natural_key,
            source_modified_at: draft.modified_at,
            content_hash: draft.content_hash,
            fields: draft.fields,
        };
        self.pending.insert(write.key.clone(), Baseline::from(&write));

        Ok(match change {
            Change::Create => Decision::Create(write),
            _ => Decision::Update(write),
        })
    }

    /// Drops buffered baselines after a batch is rolled back, so the next
    /// delivery of those keys diffs against the store again.
    pub fn forget<'k>(&mut self, keys: impl IntoIterator<Item = &'k EntityKey>) {
        for key in keys {
            self.pending.remove(key);
        }
    }

    fn claim_natural_key(&mut self, draft: &EntityDraft) -> Option<RecordError> {
        if !unique_natural_key(draft.key.kind) {
            return None;
        }
        let natural_key = draft.natural_key.as_ref()?;
        match self.natural_keys.get(natural_key) {
            Some(owner) if owner != &draft.key.source_id => Some(RecordError {
                source_id: Some(draft.key.source_id.clone()),
                kind: RecordErrorKind::Invalid,
                detail: format!("duplicate {} `{natural_key}` already used by `{owner}`", draft.key.kind),
            }),
            Some(_) => None,
            None => {
                self.natural_keys
                    .insert(natural_key.clone(), draft.key.source_id.clone());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use integobase_core::{EntityFields, EntityKind, ParentRef, SiteFields, SourceKind};
    use integobase_storage::MemoryStore;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).single().unwrap()
    }

    fn draft(hash: &str, modified_at: Option<DateTime<Utc>>) -> EntityDraft {
        EntityDraft {
            key: EntityKey::new(SourceKind::Rmm, EntityKind::Site, "s1"),
            fields: EntityFields::Site(SiteFields {
                name: "HQ".into(),
                ..Default::default()
            }),
            parent: None,
            natural_key: None,
            modified_at,
            content_hash: hash.into(),
        }
    }

    fn baseline(hash: &str, modified_at: Option<DateTime<Utc>>) -> Baseline {
        Baseline {
            modified_at,
            content_hash: hash.into(),
        }
    }

    #[test]
    fn markers_decide_when_both_present() {
        let stored = baseline("a", Some(ts(1)));
        assert_eq!(classify_change(Some(&stored), &draft("b", Some(ts(2)))), Change::Update);
        assert_eq!(classify_change(Some(&stored), &draft("b", Some(ts(1)))), Change::Unchanged);
        assert_eq!(classify_change(Some(&stored), &draft("b", Some(ts(0)))), Change::Unchanged);
    }

    #[test]
    fn hashes_decide_without_markers() {
        let stored = baseline("a", None);
        assert_eq!(classify_change(Some(&stored), &draft("a", None)), Change::Unchanged);
        assert_eq!(classify_change(Some(&stored), &draft("b", None)), Change::Update);
        assert_eq!(classify_change(None, &draft("a", None)), Change::Create);
    }

    #[tokio::test]
    async fn missing_parent_defers() {
        let store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&store);
        let mut orphan = draft("a", None);
        orphan.parent = Some(ParentRef::by_natural_key(
            SourceKind::Helpdesk,
            EntityKind::Client,
            "NOPE",
        ));
        let decision = reconciler.reconcile_draft(orphan).await.unwrap();
        assert!(matches!(decision, Decision::Deferred(_)));
    }

    #[tokio::test]
    async fn repeated_delivery_in_one_run_diffs_against_buffer() {
        let store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&store);
        assert!(matches!(
            reconciler.reconcile_draft(draft("a", None)).await.unwrap(),
            Decision::Create(_)
        ));
        assert_eq!(reconciler.reconcile_draft(draft("a", None)).await.unwrap(), Decision::Unchanged);
        assert!(matches!(
            reconciler.reconcile_draft(draft("b", None)).await.unwrap(),
            Decision::Update(_)
        ));

        reconciler.forget([&draft("a", None).key]);
        assert!(matches!(
            reconciler.reconcile_draft(draft("a", None)).await.unwrap(),
            Decision::Create(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_contact_email_is_invalid() {
        let store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&store);
        let contact = |id: u64| {
            SourceRecord::new(
                SourceKind::Helpdesk,
                EntityKind::Contact,
                json!({"primary_email": "dup@example.com", "active": true}),
            )
            .with_source_id(id.to_string())
        };

        assert!(matches!(reconciler.reconcile(&contact(1)).await.unwrap(), Decision::Create(_)));
        match reconciler.reconcile(&contact(2)).await.unwrap() {
            Decision::Invalid(err) => {
                assert_eq!(err.source_id.as_deref(), Some("2"));
                assert!(err.detail.contains("dup@example.com"));
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }
}
