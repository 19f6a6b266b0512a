use async_trait::async_trait;
use integobase_core::{
    Checkpoint, Entity, EntityFields, EntityKey, EntityKind, JobId, ParentKey, ParentRef,
    RecordError, RunCounts, RunOutcome, RunTrigger, SourceKind, SyncRun,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    BatchReceipt, EntityPage, EntityWrite, RunFilter, StoreError, SyncStore, ABANDONED_RUN_MESSAGE,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENTITY_COLUMNS: &str = "id, source, kind, source_id, parent_id, natural_key, \
     source_modified_at, content_hash, version, fields, created_at, updated_at";

const RUN_COLUMNS: &str = "id, source, kind, trigger, started_at, finished_at, outcome, \
     counts, checkpoint_before, checkpoint_after, errors, message";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn map_entity(row: &PgRow) -> Result<Entity, StoreError> {
        let source: String = row.try_get("source")?;
        let kind: String = row.try_get("kind")?;
        let fields: Json<EntityFields> = row.try_get("fields")?;
        Ok(Entity {
            id: row.try_get("id")?,
            key: EntityKey {
                source: parse_source(&source)?,
                kind: parse_kind(&kind)?,
                source_id: row.try_get("source_id")?,
            },
            parent_id: row.try_get("parent_id")?,
            natural_key: row.try_get("natural_key")?,
            source_modified_at: row.try_get("source_modified_at")?,
            content_hash: row.try_get("content_hash")?,
            version: row.try_get("version")?,
            fields: fields.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_run(row: &PgRow) -> Result<SyncRun, StoreError> {
        let source: String = row.try_get("source")?;
        let kind: String = row.try_get("kind")?;
        let trigger: String = row.try_get("trigger")?;
        let outcome: String = row.try_get("outcome")?;
        let counts: Json<RunCounts> = row.try_get("counts")?;
        let before: Option<Json<Checkpoint>> = row.try_get("checkpoint_before")?;
        let after: Option<Json<Checkpoint>> = row.try_get("checkpoint_after")?;
        let errors: Json<Vec<RecordError>> = row.try_get("errors")?;
        Ok(SyncRun {
            id: row.try_get("id")?,
            job: JobId::new(parse_source(&source)?, parse_kind(&kind)?),
            trigger: RunTrigger::parse(&trigger)
                .ok_or_else(|| StoreError::Decode(format!("unknown run trigger `{trigger}`")))?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            outcome: RunOutcome::parse(&outcome)
                .ok_or_else(|| StoreError::Decode(format!("unknown run outcome `{outcome}`")))?,
            counts: counts.0,
            checkpoint_before: before.map(|c| c.0),
            checkpoint_after: after.map(|c| c.0),
            errors: errors.0,
            message: row.try_get("message")?,
        })
    }
}

fn parse_source(value: &str) -> Result<SourceKind, StoreError> {
    value.parse().map_err(|e: integobase_core::ParseIdError| StoreError::Decode(e.to_string()))
}

fn parse_kind(value: &str) -> Result<EntityKind, StoreError> {
    value.parse().map_err(|e: integobase_core::ParseIdError| StoreError::Decode(e.to_string()))
}

#[async_trait]
impl SyncStore for PgStore {
    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, source, kind, trigger, started_at, outcome, counts,
                                   checkpoint_before, errors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.job.source.as_str())
        .bind(run.job.kind.as_str())
        .bind(run.trigger.as_str())
        .bind(run.started_at)
        .bind(run.outcome.as_str())
        .bind(Json(&run.counts))
        .bind(run.checkpoint_before.as_ref().map(Json))
        .bind(Json(&run.errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET finished_at = $2,
                   outcome = $3,
                   counts = $4,
                   checkpoint_before = $5,
                   checkpoint_after = $6,
                   errors = $7,
                   message = $8
             WHERE id = $1
               AND outcome = 'running'
            "#,
        )
        .bind(run.id)
        .bind(run.finished_at)
        .bind(run.outcome.as_str())
        .bind(Json(&run.counts))
        .bind(run.checkpoint_before.as_ref().map(Json))
        .bind(run.checkpoint_after.as_ref().map(Json))
        .bind(Json(&run.errors))
        .bind(run.message.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM sync_runs WHERE id = $1")
            .bind(run.id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(StoreError::RunFinalized(run.id))
        } else {
            Err(StoreError::RunNotFound(run.id))
        }
    }

    async fn load_checkpoint(&self, job: JobId) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT watermark, page_token, updated_at FROM sync_checkpoints WHERE source = $1 AND kind = $2",
        )
        .bind(job.source.as_str())
        .bind(job.kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Checkpoint, StoreError> {
            Ok(Checkpoint {
                watermark: row.try_get("watermark")?,
                page_token: row.try_get("page_token")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(&self, job: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (source, kind, watermark, page_token, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source, kind) DO UPDATE
               SET watermark = EXCLUDED.watermark,
                   page_token = EXCLUDED.page_token,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.source.as_str())
        .bind(job.kind.as_str())
        .bind(checkpoint.watermark)
        .bind(checkpoint.page_token.as_deref())
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE source = $1 AND kind = $2 AND source_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(key.source.as_str())
            .bind(key.kind.as_str())
            .bind(&key.source_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_entity).transpose()
    }

    async fn resolve_parent(&self, parent: &ParentRef) -> Result<Option<Uuid>, StoreError> {
        let (column, value) = match &parent.key {
            ParentKey::SourceId(v) => ("source_id", v),
            ParentKey::NaturalKey(v) => ("natural_key", v),
        };
        let sql = format!(
            "SELECT id FROM entities WHERE source = $1 AND kind = $2 AND {column} = $3 ORDER BY created_at LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(parent.source.as_str())
            .bind(parent.kind.as_str())
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn commit_batch(&self, writes: &[EntityWrite]) -> Result<BatchReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut receipt = BatchReceipt::default();

        for write in writes {
            let row = sqlx::query(
                r#"
                INSERT INTO entities (id, source, kind, source_id, parent_id, natural_key,
                                      source_modified_at, content_hash, version, fields)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9)
                ON CONFLICT (source, kind, source_id) DO UPDATE
                   SET parent_id = EXCLUDED.parent_id,
                       natural_key = EXCLUDED.natural_key,
                       source_modified_at = EXCLUDED.source_modified_at,
                       content_hash = EXCLUDED.content_hash,
                       fields = EXCLUDED.fields,
                       version = entities.version + 1,
                       updated_at = NOW()
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(write.key.source.as_str())
            .bind(write.key.kind.as_str())
            .bind(&write.key.source_id)
            .bind(write.parent_id)
            .bind(write.natural_key.as_deref())
            .bind(write.source_modified_at)
            .bind(&write.content_hash)
            .bind(Json(&write.fields))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Write {
                source_id: write.key.source_id.clone(),
                detail: e.to_string(),
            })?;

            let inserted: bool = row.try_get("inserted")?;
            if inserted {
                receipt.created += 1;
            } else {
                receipt.updated += 1;
            }
        }

        tx.commit().await?;
        debug!(created = receipt.created, updated = receipt.updated, "batch committed");
        Ok(receipt)
    }

    async fn get_entity_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::map_entity).transpose()
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        offset: u64,
        limit: u64,
    ) -> Result<EntityPage, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM entities WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = $1 ORDER BY created_at, source_id OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(Self::map_entity)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EntityPage {
            items,
            total: total.max(0) as u64,
            offset,
            limit,
        })
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM sync_runs
             WHERE ($1::text IS NULL OR source = $1)
               AND ($2::text IS NULL OR kind = $2)
             ORDER BY started_at DESC
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.job.map(|j| j.source.as_str()))
            .bind(filter.job.map(|j| j.kind.as_str()))
            .bind(filter.limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_run).collect()
    }

    async fn latest_runs(&self) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (source, kind) {RUN_COLUMNS}
              FROM sync_runs
             ORDER BY source, kind, started_at DESC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_run).collect()
    }

    async fn abandon_running_runs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET outcome = 'failure',
                   finished_at = NOW(),
                   message = $1
             WHERE outcome = 'running'
            "#,
        )
        .bind(ABANDONED_RUN_MESSAGE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
