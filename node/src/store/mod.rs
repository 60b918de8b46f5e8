//! Persistence seams of the node.
//!
//! Three stores back a node: the sync queue, the identity metadata and the
//! local entity table the POS writes to. Each has an in-memory
//! implementation (tests, database-less runs) and a PostgreSQL one.
//!
//! A remote record lands through a [`RecordWriter`], which writes the entity
//! row and its identity metadata as one unit.

mod memory;
mod postgres;

pub use memory::{MemoryEntityStore, MemoryMetadataStore, MemoryQueueStore};
pub use postgres::{
    create_pool, run_migrations, PgEntityStore, PgMetadataStore, PgQueueStore, PgRecordWriter, Pool,
};

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use possync_engine::{
    CloudId, DequeueRequest, EnqueueOutcome, LegacyId, LinkOutcome, LocalId, MetadataState,
    Mutation, QueueId, QueueRecord, QueueState, QueueStats, SyncMetadata, SyncOptions, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Durable sync queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add a mutation, coalescing into the open entry of the same record.
    async fn enqueue(&self, mutation: Mutation, now: Timestamp) -> SyncResult<EnqueueOutcome>;

    /// Lock up to `request.limit` open entries for one cycle.
    async fn dequeue_batch(
        &self,
        request: &DequeueRequest,
        lock_token: &str,
        now: Timestamp,
    ) -> SyncResult<Vec<QueueRecord>>;

    async fn mark_done(&self, id: QueueId, now: Timestamp) -> SyncResult<()>;

    /// Record a rejection; returns the resulting state (`error` or `dead`).
    async fn mark_failed(&self, id: QueueId, message: &str, now: Timestamp)
        -> SyncResult<QueueState>;

    /// Unlock entries without consuming retry budget.
    async fn release(&self, ids: &[QueueId]) -> SyncResult<usize>;

    async fn requeue(&self, id: QueueId) -> SyncResult<()>;

    async fn requeue_dead(&self) -> SyncResult<usize>;

    async fn recover_stale(&self, older_than: Timestamp) -> SyncResult<usize>;

    async fn cleanup(&self, older_than: Timestamp) -> SyncResult<usize>;

    async fn get(&self, id: QueueId) -> SyncResult<Option<QueueRecord>>;

    async fn list(&self, state: QueueState, limit: usize) -> SyncResult<Vec<QueueRecord>>;

    async fn stats(&self) -> SyncResult<QueueStats>;
}

/// Identity metadata keyed by `(model, local_id)`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<SyncMetadata>>;

    async fn find_by_cloud(
        &self,
        model: &str,
        cloud_sync_id: CloudId,
    ) -> SyncResult<Option<SyncMetadata>>;

    async fn find_by_legacy(&self, model: &str, legacy_id: LegacyId)
        -> SyncResult<Vec<SyncMetadata>>;

    /// Bind a local record to a cloud id. Fails when the record is linked
    /// to another cloud id or the cloud id is held by another record.
    async fn link(
        &self,
        model: &str,
        local_id: LocalId,
        cloud_sync_id: CloudId,
    ) -> SyncResult<LinkOutcome>;

    async fn set_legacy(&self, model: &str, local_id: LocalId, legacy_id: LegacyId)
        -> SyncResult<()>;

    async fn set_state(
        &self,
        model: &str,
        local_id: LocalId,
        state: MetadataState,
        now: Timestamp,
    ) -> SyncResult<()>;

    async fn remove(&self, model: &str, local_id: LocalId) -> SyncResult<()>;
}

/// A record of the local entity table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    pub local_id: LocalId,
    pub payload: Value,
}

/// The POS's own records.
///
/// Writes notify the registered mutation observers after commit unless
/// `options.skip_queue` is set.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<LocalRecord>>;

    /// Records whose payload holds every `(field, value)` pair, lowest id
    /// first.
    async fn find_by_fields(
        &self,
        model: &str,
        fields: &[(String, Value)],
    ) -> SyncResult<Vec<LocalRecord>>;

    async fn create(&self, model: &str, payload: Value, options: SyncOptions)
        -> SyncResult<LocalId>;

    /// Merge `payload` into the stored record.
    async fn update(
        &self,
        model: &str,
        local_id: LocalId,
        payload: Value,
        options: SyncOptions,
    ) -> SyncResult<bool>;

    async fn delete(&self, model: &str, local_id: LocalId, options: SyncOptions)
        -> SyncResult<bool>;

    async fn count(&self, model: &str) -> SyncResult<u64>;
}

/// One remote record to write locally, with the identity to stamp on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub model: String,
    /// Matched local record; `None` creates one
    pub target: Option<LocalId>,
    pub payload: Value,
    pub link: Option<CloudId>,
    pub legacy_id: Option<LegacyId>,
    pub synced_at: Timestamp,
}

/// Local effect of a [`RecordWrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    Created(LocalId),
    Updated(LocalId),
}

impl Written {
    pub fn local_id(&self) -> LocalId {
        match self {
            Written::Created(local_id) | Written::Updated(local_id) => *local_id,
        }
    }
}

/// Writes a remote record and its identity metadata as one unit: a failure
/// leaves neither a new entity row nor partial metadata behind.
///
/// A link the metadata refuses (cloud id held by another record) is logged
/// and the record stays unlinked. Writes never reach the sync queue.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn write(&self, write: RecordWrite) -> SyncResult<Written>;
}

/// [`RecordWriter`] over separate entity and metadata stores.
///
/// Deletes a record it just created when stamping its identity fails. An
/// updated record keeps its new payload; it is found again by the key that
/// matched it.
#[derive(Clone)]
pub struct StoreWriter {
    metadata: Arc<dyn MetadataStore>,
    entities: Arc<dyn EntityStore>,
}

impl StoreWriter {
    pub fn new(metadata: Arc<dyn MetadataStore>, entities: Arc<dyn EntityStore>) -> Self {
        Self { metadata, entities }
    }

    async fn stamp(&self, write: &RecordWrite, local_id: LocalId) -> SyncResult<()> {
        if let Some(cloud_sync_id) = write.link {
            let linked = self.metadata.link(&write.model, local_id, cloud_sync_id).await;
            tolerate_refused_link(&write.model, local_id, cloud_sync_id, linked)?;
        }
        if let Some(legacy_id) = write.legacy_id {
            self.metadata
                .set_legacy(&write.model, local_id, legacy_id)
                .await?;
        }
        self.metadata
            .set_state(&write.model, local_id, MetadataState::Synced, write.synced_at)
            .await
    }
}

#[async_trait]
impl RecordWriter for StoreWriter {
    async fn write(&self, write: RecordWrite) -> SyncResult<Written> {
        let options = SyncOptions::skip_queue();
        let updated = match write.target {
            Some(local_id) => {
                self.entities
                    .update(&write.model, local_id, write.payload.clone(), options)
                    .await?
            }
            None => false,
        };
        let written = match write.target {
            Some(local_id) if updated => Written::Updated(local_id),
            _ => Written::Created(
                self.entities
                    .create(&write.model, write.payload.clone(), options)
                    .await?,
            ),
        };

        let Err(e) = self.stamp(&write, written.local_id()).await else {
            return Ok(written);
        };
        if let Written::Created(local_id) = written {
            tracing::warn!(model = %write.model, local_id, error = %e, "Undoing create");
            let undone = match self.entities.delete(&write.model, local_id, options).await {
                Ok(_) => self.metadata.remove(&write.model, local_id).await,
                Err(undo) => Err(undo),
            };
            if let Err(undo) = undone {
                tracing::error!(model = %write.model, local_id, error = %undo, "Undo failed");
            }
        }
        Err(e)
    }
}

/// A link refused by the identity rules leaves the record unlinked; any
/// other failure aborts the write.
pub(crate) fn tolerate_refused_link(
    model: &str,
    local_id: LocalId,
    cloud_sync_id: CloudId,
    linked: SyncResult<LinkOutcome>,
) -> SyncResult<()> {
    match linked {
        Ok(_) => Ok(()),
        Err(SyncError::Engine(e)) => {
            tracing::warn!(model = %model, local_id, cloud_sync_id, error = %e, "Link refused");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Shallow merge of a JSON object into another.
pub(crate) fn merge_payload(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}
