//! POS Node - sync agent between a point-of-sale node and the PRINCIPAL.
//!
//! Local writes go through an [`store::EntityStore`]; committed writes are
//! captured into the sync queue by [`capture::QueueCapture`]. The
//! [`dispatcher::Dispatcher`] pushes the queue and, in hybrid mode, pulls
//! remote changes; the [`migration::MigrationPipeline`] imports master data.
//! An axum admin API exposes status and control.

pub mod auth;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod migration;
pub mod profiles;
pub mod resolve;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod transport;

use crate::capture::{ObserverList, QueueCapture};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, RunLock};
use crate::migration::MigrationPipeline;
use crate::resolve::IdentityResolver;
use crate::scheduler::{Scheduler, SyncTrigger};
use crate::store::{
    EntityStore, MemoryEntityStore, MemoryMetadataStore, MemoryQueueStore, MetadataStore,
    PgEntityStore, PgMetadataStore, PgQueueStore, PgRecordWriter, Pool, QueueStore, RecordWriter,
    StoreWriter,
};
use crate::transport::Transport;
use axum::Router;
use possync_engine::{CaptureFilter, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<dyn QueueStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub migration: Arc<MigrationPipeline>,
    pub trigger: SyncTrigger,
}

/// The three stores a node runs on, the writer remote records land
/// through, and the observers its entity writes notify.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn QueueStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub entities: Arc<dyn EntityStore>,
    pub writer: Arc<dyn RecordWriter>,
    pub observers: ObserverList,
}

impl Stores {
    pub fn memory(max_retries: u32) -> Self {
        let observers = ObserverList::new();
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let entities: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new(observers.clone()));
        Self {
            queue: Arc::new(MemoryQueueStore::new(max_retries)),
            writer: Arc::new(StoreWriter::new(metadata.clone(), entities.clone())),
            metadata,
            entities,
            observers,
        }
    }

    pub fn postgres(pool: Pool, max_retries: u32) -> Self {
        let observers = ObserverList::new();
        Self {
            queue: Arc::new(PgQueueStore::new(pool.clone(), max_retries)),
            metadata: Arc::new(PgMetadataStore::new(pool.clone())),
            entities: Arc::new(PgEntityStore::new(pool.clone(), observers.clone())),
            writer: Arc::new(PgRecordWriter::new(pool, observers.clone())),
            observers,
        }
    }
}

/// A wired node: admin state plus the scheduler that drives cycles.
pub struct Node {
    pub state: AppState,
    pub scheduler: Scheduler,
}

impl Node {
    /// Wire capture, resolver, dispatcher and migration over `stores`.
    ///
    /// `transport` replaces the HTTP transport built from the configuration.
    pub fn assemble(
        config: Config,
        stores: &Stores,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        let capture = QueueCapture::new(CaptureFilter::from_config(&config.sync), stores.queue.clone());
        stores.observers.register(Arc::new(capture));

        let resolver = IdentityResolver::new(
            Arc::new(profiles::default_profiles()),
            stores.metadata.clone(),
            stores.entities.clone(),
        )
        .with_writer(stores.writer.clone());

        let run_lock = RunLock::default();
        let mut dispatcher = Dispatcher::new(
            config.sync.clone(),
            stores.queue.clone(),
            stores.metadata.clone(),
            resolver.clone(),
        )
        .with_retention(Duration::from_millis(config.queue_retention_millis()))
        .with_run_lock(run_lock.clone());
        let mut migration = MigrationPipeline::new(resolver).with_run_lock(run_lock);
        if let Some(transport) = transport {
            dispatcher = dispatcher.with_transport(transport.clone());
            migration = migration.with_transport(transport);
        }

        let dispatcher = Arc::new(dispatcher);
        let trigger = SyncTrigger::new();
        let scheduler = Scheduler::new(dispatcher.clone(), trigger.clone());
        let state = AppState {
            config: Arc::new(config),
            queue: stores.queue.clone(),
            dispatcher,
            migration: Arc::new(migration),
            trigger,
        };
        Node { state, scheduler }
    }
}

/// Build the admin router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
