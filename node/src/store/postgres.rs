//! PostgreSQL stores.
//!
//! Queue transitions load the row `FOR UPDATE`, apply the engine's
//! [`QueueRecord`] transition and write the row back in one transaction.
//! Every write that can add a row to the open set of a record first takes a
//! transaction-scoped advisory lock on `(model, record_id)`, so the partial
//! unique index on open rows is never raced.

use super::{
    tolerate_refused_link, EntityStore, LocalRecord, MetadataStore, QueueStore, RecordWrite,
    RecordWriter, Written,
};
use crate::capture::ObserverList;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use possync_engine::{
    validate_link, CloudId, DequeueRequest, EnqueueOutcome, Error as EngineError, FoldOutcome,
    LegacyId, LinkOutcome, LocalId, MetadataState, Mutation, MutationEvent, Operation, QueueId,
    QueueRecord, QueueState, QueueStats, SyncMetadata, SyncOptions, Timestamp,
};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

const QUEUE_COLUMNS: &str = "id, model_name, record_id, operation, payload, node_scope, \
    priority, state, retry_count, max_retries, created_at, last_attempt_at, error_message, \
    lock_token";

/// A stored queue row.
#[derive(Debug)]
struct QueueRow {
    id: i64,
    model_name: String,
    record_id: i64,
    operation: String,
    payload: Value,
    node_scope: String,
    priority: i32,
    state: String,
    retry_count: i32,
    max_retries: i32,
    created_at: i64,
    last_attempt_at: Option<i64>,
    error_message: Option<String>,
    lock_token: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for QueueRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueRow {
            id: row.try_get("id")?,
            model_name: row.try_get("model_name")?,
            record_id: row.try_get("record_id")?,
            operation: row.try_get("operation")?,
            payload: row.try_get("payload")?,
            node_scope: row.try_get("node_scope")?,
            priority: row.try_get("priority")?,
            state: row.try_get("state")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            error_message: row.try_get("error_message")?,
            lock_token: row.try_get("lock_token")?,
        })
    }
}

impl QueueRow {
    fn into_record(self) -> SyncResult<QueueRecord> {
        Ok(QueueRecord {
            id: self.id,
            model_name: self.model_name,
            record_id: self.record_id,
            operation: self.operation.parse()?,
            payload: self.payload,
            node_scope: self.node_scope,
            priority: self.priority,
            state: self.state.parse()?,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            created_at: self.created_at.max(0) as u64,
            last_attempt_at: self.last_attempt_at.map(|t| t.max(0) as u64),
            error_message: self.error_message,
            lock_token: self.lock_token,
        })
    }
}

/// Sync queue in the `sync_queue` table.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    max_retries: u32,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    async fn lock_key(
        tx: &mut Transaction<'_, Postgres>,
        model: &str,
        record_id: LocalId,
    ) -> SyncResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("sync_queue:{}:{}", model, record_id))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: QueueId,
    ) -> SyncResult<QueueRecord> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM sync_queue WHERE id = $1 FOR UPDATE",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(EngineError::QueueEntryNotFound(id))?;
        row.into_record()
    }

    async fn open_for_key(
        tx: &mut Transaction<'_, Postgres>,
        model: &str,
        record_id: LocalId,
        except: Option<QueueId>,
    ) -> SyncResult<Option<QueueRecord>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM sync_queue \
             WHERE model_name = $1 AND record_id = $2 AND state IN ('pending', 'error') \
               AND ($3::BIGINT IS NULL OR id <> $3) \
             FOR UPDATE",
            QUEUE_COLUMNS
        ))
        .bind(model)
        .bind(record_id)
        .bind(except)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(QueueRow::into_record).transpose()
    }

    async fn save(tx: &mut Transaction<'_, Postgres>, record: &QueueRecord) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET operation = $2, payload = $3, priority = $4, state = $5, retry_count = $6,
                created_at = $7, last_attempt_at = $8, error_message = $9, lock_token = $10
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.operation.as_str())
        .bind(&record.payload)
        .bind(record.priority)
        .bind(record.state.as_str())
        .bind(record.retry_count as i32)
        .bind(record.created_at as i64)
        .bind(record.last_attempt_at.map(|t| t as i64))
        .bind(record.error_message.as_deref())
        .bind(record.lock_token.as_deref())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete(tx: &mut Transaction<'_, Postgres>, id: QueueId) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Persist a transitioned record, folding it into a newer open row for
    /// the same record when it re-entered the open set.
    async fn settle(tx: &mut Transaction<'_, Postgres>, record: QueueRecord) -> SyncResult<()> {
        if record.state.is_open() {
            let newer =
                Self::open_for_key(tx, &record.model_name, record.record_id, Some(record.id))
                    .await?;
            if let Some(mut newer) = newer {
                Self::delete(tx, record.id).await?;
                match record.fold_into(&mut newer) {
                    FoldOutcome::Merged => Self::save(tx, &newer).await?,
                    FoldOutcome::Cancelled => Self::delete(tx, newer.id).await?,
                }
                return Ok(());
            }
        }
        Self::save(tx, &record).await
    }

    /// Load, transition and settle one row in its own transaction.
    async fn transition<T, F>(&self, id: QueueId, apply: F) -> SyncResult<T>
    where
        F: FnOnce(&mut QueueRecord) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::load_for_update(&mut tx, id).await?;
        Self::lock_key(&mut tx, &record.model_name, record.record_id).await?;
        let result = apply(&mut record)?;
        Self::settle(&mut tx, record).await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, mutation: Mutation, now: Timestamp) -> SyncResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::lock_key(&mut tx, &mutation.model, mutation.record_id).await?;

        if let Some(mut open) =
            Self::open_for_key(&mut tx, &mutation.model, mutation.record_id, None).await?
        {
            let id = open.id;
            let outcome = if open.coalesce(mutation) {
                Self::save(&mut tx, &open).await?;
                EnqueueOutcome::Coalesced(id)
            } else {
                Self::delete(&mut tx, id).await?;
                EnqueueOutcome::Cancelled(id)
            };
            tx.commit().await?;
            return Ok(outcome);
        }

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sync_queue (
                model_name, record_id, operation, payload, node_scope,
                priority, state, retry_count, max_retries, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&mutation.model)
        .bind(mutation.record_id)
        .bind(mutation.operation.as_str())
        .bind(&mutation.payload)
        .bind(&mutation.node_scope)
        .bind(mutation.priority)
        .bind(self.max_retries as i32)
        .bind(now as i64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn dequeue_batch(
        &self,
        request: &DequeueRequest,
        lock_token: &str,
        now: Timestamp,
    ) -> SyncResult<Vec<QueueRecord>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            UPDATE sync_queue
            SET state = 'sent', lock_token = $1, last_attempt_at = $2
            WHERE id IN (
                SELECT id FROM sync_queue
                WHERE state IN ('pending', 'error')
                  AND node_scope = $3
                  AND ($4::TEXT IS NULL OR model_name = $4)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(lock_token)
        .bind(now as i64)
        .bind(&request.node_scope)
        .bind(request.model.as_deref())
        .bind(request.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = rows
            .into_iter()
            .map(QueueRow::into_record)
            .collect::<SyncResult<Vec<_>>>()?;
        batch.sort_by(QueueRecord::dequeue_order);
        Ok(batch)
    }

    async fn mark_done(&self, id: QueueId, now: Timestamp) -> SyncResult<()> {
        self.transition(id, |record| record.complete(now)).await
    }

    async fn mark_failed(
        &self,
        id: QueueId,
        message: &str,
        now: Timestamp,
    ) -> SyncResult<QueueState> {
        let message = message.to_string();
        self.transition(id, move |record| record.fail(message, now))
            .await
    }

    async fn release(&self, ids: &[QueueId]) -> SyncResult<usize> {
        let mut released = 0;
        for &id in ids {
            let unlocked = self
                .transition(id, |record| Ok(record.unlock()))
                .await;
            match unlocked {
                Ok(true) => released += 1,
                Ok(false) | Err(SyncError::Engine(EngineError::QueueEntryNotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    async fn requeue(&self, id: QueueId) -> SyncResult<()> {
        self.transition(id, QueueRecord::reset).await
    }

    async fn requeue_dead(&self) -> SyncResult<usize> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM sync_queue WHERE state = 'dead' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        let mut requeued = 0;
        for id in ids {
            if self.requeue(id).await.is_ok() {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn recover_stale(&self, older_than: Timestamp) -> SyncResult<usize> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_queue \
             WHERE state = 'sent' AND COALESCE(last_attempt_at, created_at) < $1",
        )
        .bind(older_than as i64)
        .fetch_all(&self.pool)
        .await?;
        self.release(&ids).await
    }

    async fn cleanup(&self, older_than: Timestamp) -> SyncResult<usize> {
        let result = sqlx::query(
            "DELETE FROM sync_queue \
             WHERE state IN ('done', 'dead') AND COALESCE(last_attempt_at, created_at) < $1",
        )
        .bind(older_than as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, id: QueueId) -> SyncResult<Option<QueueRecord>> {
        sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM sync_queue WHERE id = $1",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(QueueRow::into_record)
        .transpose()
    }

    async fn list(&self, state: QueueState, limit: usize) -> SyncResult<Vec<QueueRecord>> {
        sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM sync_queue WHERE state = $1 ORDER BY id LIMIT $2",
            QUEUE_COLUMNS
        ))
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(QueueRow::into_record)
        .collect()
    }

    async fn stats(&self) -> SyncResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM sync_queue GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.add(state.parse()?, count.max(0) as u64);
        }
        Ok(stats)
    }
}

/// A stored metadata row.
#[derive(Debug)]
struct MetadataRow {
    model: String,
    local_id: i64,
    cloud_sync_id: Option<i64>,
    legacy_id: Option<i64>,
    state: String,
    last_sync: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MetadataRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MetadataRow {
            model: row.try_get("model")?,
            local_id: row.try_get("local_id")?,
            cloud_sync_id: row.try_get("cloud_sync_id")?,
            legacy_id: row.try_get("legacy_id")?,
            state: row.try_get("state")?,
            last_sync: row.try_get("last_sync")?,
        })
    }
}

impl MetadataRow {
    fn into_metadata(self) -> SyncResult<SyncMetadata> {
        Ok(SyncMetadata {
            model: self.model,
            local_id: self.local_id,
            cloud_sync_id: self.cloud_sync_id,
            legacy_id: self.legacy_id,
            state: self.state.parse()?,
            last_sync: self.last_sync.map(|t| t.max(0) as u64),
        })
    }
}

const METADATA_COLUMNS: &str = "model, local_id, cloud_sync_id, legacy_id, state, last_sync";

/// Identity metadata in the `sync_metadata` table.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        condition: &str,
        model: &str,
        value: i64,
    ) -> SyncResult<Option<SyncMetadata>> {
        sqlx::query_as::<_, MetadataRow>(&format!(
            "SELECT {} FROM sync_metadata WHERE model = $1 AND {} = $2",
            METADATA_COLUMNS, condition
        ))
        .bind(model)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?
        .map(MetadataRow::into_metadata)
        .transpose()
    }

    /// Link inside the caller's transaction. The advisory lock serialises
    /// links of one cloud id until that transaction ends.
    async fn link_on(
        conn: &mut PgConnection,
        model: &str,
        local_id: LocalId,
        cloud_sync_id: CloudId,
    ) -> SyncResult<LinkOutcome> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("sync_metadata:{}:{}", model, cloud_sync_id))
            .execute(&mut *conn)
            .await?;

        let current: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT cloud_sync_id FROM sync_metadata WHERE model = $1 AND local_id = $2 FOR UPDATE",
        )
        .bind(model)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
        let holder: Option<i64> = sqlx::query_scalar(
            "SELECT local_id FROM sync_metadata WHERE model = $1 AND cloud_sync_id = $2",
        )
        .bind(model)
        .bind(cloud_sync_id)
        .fetch_optional(&mut *conn)
        .await?;

        let outcome = validate_link(model, local_id, cloud_sync_id, current.flatten(), holder)?;
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (model, local_id, cloud_sync_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (model, local_id) DO UPDATE SET cloud_sync_id = EXCLUDED.cloud_sync_id
            "#,
        )
        .bind(model)
        .bind(local_id)
        .bind(cloud_sync_id)
        .execute(&mut *conn)
        .await?;
        Ok(outcome)
    }

    async fn set_legacy_on(
        conn: &mut PgConnection,
        model: &str,
        local_id: LocalId,
        legacy_id: LegacyId,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (model, local_id, legacy_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (model, local_id) DO UPDATE SET legacy_id = EXCLUDED.legacy_id
            "#,
        )
        .bind(model)
        .bind(local_id)
        .bind(legacy_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn set_state_on(
        conn: &mut PgConnection,
        model: &str,
        local_id: LocalId,
        state: MetadataState,
        now: Timestamp,
    ) -> SyncResult<()> {
        let last_sync = (state == MetadataState::Synced).then_some(now as i64);
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (model, local_id, state, last_sync)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (model, local_id) DO UPDATE
            SET state = EXCLUDED.state,
                last_sync = COALESCE(EXCLUDED.last_sync, sync_metadata.last_sync)
            "#,
        )
        .bind(model)
        .bind(local_id)
        .bind(state.as_str())
        .bind(last_sync)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<SyncMetadata>> {
        self.fetch_one_where("local_id", model, local_id).await
    }

    async fn find_by_cloud(
        &self,
        model: &str,
        cloud_sync_id: CloudId,
    ) -> SyncResult<Option<SyncMetadata>> {
        self.fetch_one_where("cloud_sync_id", model, cloud_sync_id)
            .await
    }

    async fn find_by_legacy(
        &self,
        model: &str,
        legacy_id: LegacyId,
    ) -> SyncResult<Vec<SyncMetadata>> {
        sqlx::query_as::<_, MetadataRow>(&format!(
            "SELECT {} FROM sync_metadata WHERE model = $1 AND legacy_id = $2 ORDER BY local_id",
            METADATA_COLUMNS
        ))
        .bind(model)
        .bind(legacy_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MetadataRow::into_metadata)
        .collect()
    }

    async fn link(
        &self,
        model: &str,
        local_id: LocalId,
        cloud_sync_id: CloudId,
    ) -> SyncResult<LinkOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::link_on(&mut tx, model, local_id, cloud_sync_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn set_legacy(
        &self,
        model: &str,
        local_id: LocalId,
        legacy_id: LegacyId,
    ) -> SyncResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_legacy_on(&mut conn, model, local_id, legacy_id).await
    }

    async fn set_state(
        &self,
        model: &str,
        local_id: LocalId,
        state: MetadataState,
        now: Timestamp,
    ) -> SyncResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_state_on(&mut conn, model, local_id, state, now).await
    }

    async fn remove(&self, model: &str, local_id: LocalId) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE model = $1 AND local_id = $2")
            .bind(model)
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Local entity table `local_records`.
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    observers: ObserverList,
}

impl PgEntityStore {
    pub fn new(pool: PgPool, observers: ObserverList) -> Self {
        Self { pool, observers }
    }

    async fn committed(
        &self,
        model: &str,
        local_id: LocalId,
        operation: Operation,
        payload: Value,
        options: SyncOptions,
    ) {
        let event = MutationEvent::new(model, local_id, operation, payload);
        self.observers.notify(event, options).await;
    }

    async fn insert_on(conn: &mut PgConnection, model: &str, payload: &Value) -> SyncResult<LocalId> {
        let local_id: i64 =
            sqlx::query_scalar("INSERT INTO local_records (model, payload) VALUES ($1, $2) RETURNING id")
                .bind(model)
                .bind(payload)
                .fetch_one(&mut *conn)
                .await?;
        Ok(local_id)
    }

    /// Merge `payload` into a stored record; the merged payload, or `None`
    /// when the record does not exist.
    async fn merge_on(
        conn: &mut PgConnection,
        model: &str,
        local_id: LocalId,
        payload: &Value,
    ) -> SyncResult<Option<Value>> {
        let merged: Option<Value> = sqlx::query_scalar(
            r#"
            UPDATE local_records
            SET payload = payload || $3, updated_at = NOW()
            WHERE model = $1 AND id = $2
            RETURNING payload
            "#,
        )
        .bind(model)
        .bind(local_id)
        .bind(payload)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(merged)
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<LocalRecord>> {
        let payload: Option<Value> =
            sqlx::query_scalar("SELECT payload FROM local_records WHERE model = $1 AND id = $2")
                .bind(model)
                .bind(local_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload.map(|payload| LocalRecord { local_id, payload }))
    }

    async fn find_by_fields(
        &self,
        model: &str,
        fields: &[(String, Value)],
    ) -> SyncResult<Vec<LocalRecord>> {
        let filter: serde_json::Map<String, Value> = fields.iter().cloned().collect();
        let rows: Vec<(i64, Value)> = sqlx::query_as(
            "SELECT id, payload FROM local_records WHERE model = $1 AND payload @> $2 ORDER BY id",
        )
        .bind(model)
        .bind(Value::Object(filter))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(local_id, payload)| LocalRecord { local_id, payload })
            .collect())
    }

    async fn create(
        &self,
        model: &str,
        payload: Value,
        options: SyncOptions,
    ) -> SyncResult<LocalId> {
        let mut conn = self.pool.acquire().await?;
        let local_id = Self::insert_on(&mut conn, model, &payload).await?;
        drop(conn);
        self.committed(model, local_id, Operation::Create, payload, options)
            .await;
        Ok(local_id)
    }

    async fn update(
        &self,
        model: &str,
        local_id: LocalId,
        payload: Value,
        options: SyncOptions,
    ) -> SyncResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let merged = Self::merge_on(&mut conn, model, local_id, &payload).await?;
        drop(conn);
        let Some(merged) = merged else {
            return Ok(false);
        };
        self.committed(model, local_id, Operation::Write, merged, options)
            .await;
        Ok(true)
    }

    async fn delete(
        &self,
        model: &str,
        local_id: LocalId,
        options: SyncOptions,
    ) -> SyncResult<bool> {
        let removed: Option<Value> = sqlx::query_scalar(
            "DELETE FROM local_records WHERE model = $1 AND id = $2 RETURNING payload",
        )
        .bind(model)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(payload) = removed else {
            return Ok(false);
        };
        self.committed(model, local_id, Operation::Unlink, payload, options)
            .await;
        Ok(true)
    }

    async fn count(&self, model: &str) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM local_records WHERE model = $1")
            .bind(model)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Writes a remote record and its `sync_metadata` row in one transaction.
#[derive(Clone)]
pub struct PgRecordWriter {
    pool: PgPool,
    observers: ObserverList,
}

impl PgRecordWriter {
    pub fn new(pool: PgPool, observers: ObserverList) -> Self {
        Self { pool, observers }
    }
}

#[async_trait]
impl RecordWriter for PgRecordWriter {
    async fn write(&self, write: RecordWrite) -> SyncResult<Written> {
        let model = write.model.as_str();
        let mut tx = self.pool.begin().await?;

        let merged = match write.target {
            Some(local_id) => PgEntityStore::merge_on(&mut tx, model, local_id, &write.payload).await?,
            None => None,
        };
        let (written, payload) = match (write.target, merged) {
            (Some(local_id), Some(merged)) => (Written::Updated(local_id), merged),
            _ => {
                let local_id = PgEntityStore::insert_on(&mut tx, model, &write.payload).await?;
                (Written::Created(local_id), write.payload.clone())
            }
        };
        let local_id = written.local_id();

        if let Some(cloud_sync_id) = write.link {
            let linked = PgMetadataStore::link_on(&mut tx, model, local_id, cloud_sync_id).await;
            tolerate_refused_link(model, local_id, cloud_sync_id, linked)?;
        }
        if let Some(legacy_id) = write.legacy_id {
            PgMetadataStore::set_legacy_on(&mut tx, model, local_id, legacy_id).await?;
        }
        PgMetadataStore::set_state_on(&mut tx, model, local_id, MetadataState::Synced, write.synced_at)
            .await?;
        tx.commit().await?;

        let operation = match written {
            Written::Created(_) => Operation::Create,
            Written::Updated(_) => Operation::Write,
        };
        let event = MutationEvent::new(model, local_id, operation, payload);
        self.observers.notify(event, SyncOptions::skip_queue()).await;
        Ok(written)
    }
}
