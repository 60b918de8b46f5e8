//! Post-commit mutation observers.
//!
//! Entity stores call [`ObserverList::notify`] after every committed write.
//! [`QueueCapture`] is the observer that turns those writes into queue
//! entries.

use crate::error::SyncResult;
use crate::store::QueueStore;
use crate::now_millis;
use async_trait::async_trait;
use parking_lot::RwLock;
use possync_engine::{CaptureFilter, EnqueueOutcome, MutationEvent, SyncOptions};
use std::sync::Arc;

/// Receives committed local writes.
#[async_trait]
pub trait MutationObserver: Send + Sync {
    async fn on_commit(&self, event: &MutationEvent, options: &SyncOptions) -> SyncResult<()>;
}

/// Shared list of observers, notified in registration order.
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Arc<RwLock<Vec<Arc<dyn MutationObserver>>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn MutationObserver>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Notify every observer. A failing observer is logged and never undoes
    /// the committed write.
    pub async fn notify(&self, event: MutationEvent, options: SyncOptions) {
        let observers: Vec<Arc<dyn MutationObserver>> = self.observers.read().clone();
        for observer in observers {
            if let Err(e) = observer.on_commit(&event, &options).await {
                tracing::error!(
                    model = %event.model,
                    record_id = event.record_id,
                    error = %e,
                    "Mutation observer failed"
                );
            }
        }
    }
}

/// Observer that enqueues captured writes into the sync queue.
pub struct QueueCapture {
    filter: CaptureFilter,
    queue: Arc<dyn QueueStore>,
}

impl QueueCapture {
    pub fn new(filter: CaptureFilter, queue: Arc<dyn QueueStore>) -> Self {
        Self { filter, queue }
    }
}

#[async_trait]
impl MutationObserver for QueueCapture {
    async fn on_commit(&self, event: &MutationEvent, options: &SyncOptions) -> SyncResult<()> {
        let Some(mutation) = self.filter.capture(event.clone(), options) else {
            return Ok(());
        };

        match self.queue.enqueue(mutation, now_millis()).await? {
            EnqueueOutcome::Inserted(id) => {
                tracing::debug!(queue_id = id, model = %event.model, record_id = event.record_id, "Queued mutation");
            }
            EnqueueOutcome::Coalesced(id) => {
                tracing::debug!(queue_id = id, model = %event.model, record_id = event.record_id, "Coalesced mutation");
            }
            EnqueueOutcome::Cancelled(id) => {
                tracing::debug!(queue_id = id, model = %event.model, record_id = event.record_id, "Create and unlink cancelled out");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryQueueStore;
    use possync_engine::{Operation, OperationMode, QueueState, SyncConfig};
    use serde_json::json;

    fn capture(queue: Arc<MemoryQueueStore>) -> QueueCapture {
        let config = SyncConfig::new("pos-1", "WH1")
            .with_mode(OperationMode::Offline)
            .with_entity("institution.client", true);
        QueueCapture::new(CaptureFilter::from_config(&config), queue)
    }

    #[tokio::test]
    async fn three_writes_coalesce_into_one_entry() {
        let queue = Arc::new(MemoryQueueStore::new(3));
        let observers = ObserverList::new();
        observers.register(Arc::new(capture(queue.clone())));

        for amount in [10, 20, 30] {
            let event =
                MutationEvent::new("institution.client", 4, Operation::Write, json!({"amount": amount}));
            observers.notify(event, SyncOptions::default()).await;
        }

        let pending = queue.list(QueueState::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["amount"], 30);
    }

    #[tokio::test]
    async fn skip_queue_writes_are_not_captured() {
        let queue = Arc::new(MemoryQueueStore::new(3));
        let observer = capture(queue.clone());

        let event = MutationEvent::new("institution.client", 4, Operation::Write, json!({}));
        observer
            .on_commit(&event, &SyncOptions::skip_queue())
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }
}
