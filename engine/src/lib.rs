//! # POS Sync Engine
//!
//! Deterministic core of the offline POS synchronization engine.
//!
//! A point-of-sale node keeps working while disconnected from the central
//! ERP (the PRINCIPAL). Local mutations are captured into a durable queue,
//! pushed when the network is back, and remote-originated changes are mapped
//! onto local records without creating duplicates.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or databases
//! - **Deterministic**: same inputs, same queue order, same resolved identity
//! - **Opaque entities**: domain records are `(model, id, payload)` tuples
//!
//! ## Core Concepts
//!
//! ### Sync Queue
//!
//! [`SyncQueue`] stores [`QueueRecord`]s. At most one open entry exists per
//! `(model, record_id)`: later mutations coalesce into it. Entries move
//! through [`QueueState`] (`pending → sent → done`, or `error` while retry
//! budget remains, `dead` once it is exhausted).
//!
//! ### Identity
//!
//! [`SyncMetadata`] binds a local record to its `cloud_sync_id` and legacy
//! key. The [`Resolver`] walks layered strategies (cloud id, legacy key,
//! natural key, primary key) to find the local identity of a remote record.
//!
//! ### Migration
//!
//! [`MigrationManifest`] declares per-model counts and a dependency order;
//! [`MigrationCursor`] pages through a model statelessly.
//!
//! ## Quick Start
//!
//! ```rust
//! use possync_engine::{Mutation, Operation, QueueState, SyncQueue};
//! use serde_json::json;
//!
//! let mut queue = SyncQueue::new(3);
//!
//! // Three writes to the same client coalesce into one entry.
//! for amount in [10, 20, 30] {
//!     let mutation = Mutation::new(
//!         "institution.client",
//!         7,
//!         Operation::Write,
//!         json!({"amount": amount}),
//!         "WH1",
//!     );
//!     queue.enqueue(mutation, 1_000);
//! }
//!
//! let batch = queue.dequeue_batch(&possync_engine::DequeueRequest::new(100, "WH1"), "cycle-1", 2_000);
//! assert_eq!(batch.len(), 1);
//! assert_eq!(batch[0].payload["amount"], 30);
//! assert_eq!(queue.get(batch[0].id).unwrap().state, QueueState::Sent);
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod profile;
pub mod protocol;
pub mod queue;
pub mod resolver;

// Re-export main types at crate root
pub use capture::{CaptureFilter, MutationEvent, SyncOptions};
pub use config::{OperationMode, SyncConfig};
pub use error::Error;
pub use manifest::{MigrationCursor, MigrationManifest};
pub use metadata::{validate_link, LinkOutcome, MetadataIndex, MetadataState, SyncMetadata};
pub use profile::{ModelProfile, ProfileRegistry};
pub use protocol::{
    ChangesRequest, ChangesResponse, ManifestRequest, ManifestResponse, PingResponse,
    PullBatchRequest, PullBatchResponse, PushOutcome, PushRecord, PushRequest, PushResponse,
    RecordResult, RecordStatus, RemoteChange,
};
pub use queue::{
    DequeueRequest, EnqueueOutcome, FoldOutcome, Mutation, Operation, QueueRecord, QueueState,
    QueueStats, SyncQueue,
};
pub use resolver::{
    Candidate, Candidates, ConflictKind, KeyValue, Resolution, ResolutionConflict, ResolveHints,
    ResolveMode, Resolver, Strategy,
};

/// Type aliases for clarity
pub type ModelName = String;
pub type LocalId = i64;
pub type CloudId = i64;
pub type LegacyId = i64;
pub type QueueId = i64;
pub type Priority = i32;
pub type Timestamp = u64;
