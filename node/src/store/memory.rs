//! In-memory stores.
//!
//! Thin async wrappers around the engine's data structures. Used by tests
//! and by nodes started without `DATABASE_URL`.

use super::{merge_payload, EntityStore, LocalRecord, MetadataStore, QueueStore};
use crate::capture::ObserverList;
use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use possync_engine::{
    CloudId, DequeueRequest, EnqueueOutcome, LegacyId, LinkOutcome, LocalId, MetadataIndex,
    MetadataState, Mutation, MutationEvent, Operation, QueueId, QueueRecord, QueueState,
    QueueStats, SyncMetadata, SyncOptions, SyncQueue, Timestamp,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Queue backed by [`SyncQueue`].
pub struct MemoryQueueStore {
    queue: Mutex<SyncQueue>,
}

impl MemoryQueueStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            queue: Mutex::new(SyncQueue::new(max_retries)),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, mutation: Mutation, now: Timestamp) -> SyncResult<EnqueueOutcome> {
        Ok(self.queue.lock().enqueue(mutation, now))
    }

    async fn dequeue_batch(
        &self,
        request: &DequeueRequest,
        lock_token: &str,
        now: Timestamp,
    ) -> SyncResult<Vec<QueueRecord>> {
        Ok(self.queue.lock().dequeue_batch(request, lock_token, now))
    }

    async fn mark_done(&self, id: QueueId, now: Timestamp) -> SyncResult<()> {
        Ok(self.queue.lock().mark_done(id, now)?)
    }

    async fn mark_failed(
        &self,
        id: QueueId,
        message: &str,
        now: Timestamp,
    ) -> SyncResult<QueueState> {
        Ok(self.queue.lock().mark_failed(id, message, now)?)
    }

    async fn release(&self, ids: &[QueueId]) -> SyncResult<usize> {
        Ok(self.queue.lock().release(ids))
    }

    async fn requeue(&self, id: QueueId) -> SyncResult<()> {
        Ok(self.queue.lock().requeue(id)?)
    }

    async fn requeue_dead(&self) -> SyncResult<usize> {
        Ok(self.queue.lock().requeue_dead())
    }

    async fn recover_stale(&self, older_than: Timestamp) -> SyncResult<usize> {
        Ok(self.queue.lock().recover_stale(older_than))
    }

    async fn cleanup(&self, older_than: Timestamp) -> SyncResult<usize> {
        Ok(self.queue.lock().cleanup(older_than))
    }

    async fn get(&self, id: QueueId) -> SyncResult<Option<QueueRecord>> {
        Ok(self.queue.lock().get(id).cloned())
    }

    async fn list(&self, state: QueueState, limit: usize) -> SyncResult<Vec<QueueRecord>> {
        let mut entries = self.queue.lock().list(state);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn stats(&self) -> SyncResult<QueueStats> {
        Ok(self.queue.lock().stats())
    }
}

/// Metadata backed by [`MetadataIndex`].
#[derive(Default)]
pub struct MemoryMetadataStore {
    index: Mutex<MetadataIndex>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<SyncMetadata>> {
        Ok(self.index.lock().get(model, local_id).cloned())
    }

    async fn find_by_cloud(
        &self,
        model: &str,
        cloud_sync_id: CloudId,
    ) -> SyncResult<Option<SyncMetadata>> {
        Ok(self.index.lock().find_by_cloud(model, cloud_sync_id).cloned())
    }

    async fn find_by_legacy(
        &self,
        model: &str,
        legacy_id: LegacyId,
    ) -> SyncResult<Vec<SyncMetadata>> {
        Ok(self
            .index
            .lock()
            .find_by_legacy(model, legacy_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn link(
        &self,
        model: &str,
        local_id: LocalId,
        cloud_sync_id: CloudId,
    ) -> SyncResult<LinkOutcome> {
        Ok(self.index.lock().link(model, local_id, cloud_sync_id)?)
    }

    async fn set_legacy(
        &self,
        model: &str,
        local_id: LocalId,
        legacy_id: LegacyId,
    ) -> SyncResult<()> {
        self.index.lock().set_legacy(model, local_id, legacy_id);
        Ok(())
    }

    async fn set_state(
        &self,
        model: &str,
        local_id: LocalId,
        state: MetadataState,
        now: Timestamp,
    ) -> SyncResult<()> {
        self.index.lock().set_state(model, local_id, state, now);
        Ok(())
    }

    async fn remove(&self, model: &str, local_id: LocalId) -> SyncResult<()> {
        self.index.lock().remove(model, local_id);
        Ok(())
    }
}

#[derive(Default)]
struct EntityTable {
    records: BTreeMap<(String, LocalId), Value>,
    next_id: LocalId,
}

/// Local entity table kept in memory.
#[derive(Default)]
pub struct MemoryEntityStore {
    table: Mutex<EntityTable>,
    observers: ObserverList,
}

impl MemoryEntityStore {
    pub fn new(observers: ObserverList) -> Self {
        Self {
            table: Mutex::new(EntityTable::default()),
            observers,
        }
    }

    /// All records of a model, by id.
    pub fn records(&self, model: &str) -> Vec<LocalRecord> {
        self.table
            .lock()
            .records
            .iter()
            .filter(|((m, _), _)| m == model)
            .map(|((_, local_id), payload)| LocalRecord {
                local_id: *local_id,
                payload: payload.clone(),
            })
            .collect()
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
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<LocalRecord>> {
        Ok(self
            .table
            .lock()
            .records
            .get(&(model.to_string(), local_id))
            .map(|payload| LocalRecord {
                local_id,
                payload: payload.clone(),
            }))
    }

    async fn find_by_fields(
        &self,
        model: &str,
        fields: &[(String, Value)],
    ) -> SyncResult<Vec<LocalRecord>> {
        Ok(self
            .records(model)
            .into_iter()
            .filter(|record| {
                fields
                    .iter()
                    .all(|(field, value)| record.payload.get(field) == Some(value))
            })
            .collect())
    }

    async fn create(
        &self,
        model: &str,
        payload: Value,
        options: SyncOptions,
    ) -> SyncResult<LocalId> {
        let local_id = {
            let mut table = self.table.lock();
            table.next_id += 1;
            let local_id = table.next_id;
            table
                .records
                .insert((model.to_string(), local_id), payload.clone());
            local_id
        };
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
        let merged = {
            let mut table = self.table.lock();
            let Some(stored) = table.records.get_mut(&(model.to_string(), local_id)) else {
                return Ok(false);
            };
            merge_payload(stored, payload);
            stored.clone()
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
        let removed = self
            .table
            .lock()
            .records
            .remove(&(model.to_string(), local_id));
        let Some(payload) = removed else {
            return Ok(false);
        };
        self.committed(model, local_id, Operation::Unlink, payload, options)
            .await;
        Ok(true)
    }

    async fn count(&self, model: &str) -> SyncResult<u64> {
        Ok(self
            .table
            .lock()
            .records
            .keys()
            .filter(|(m, _)| m == model)
            .count() as u64)
    }
}
