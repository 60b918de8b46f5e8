//! Error types for the sync engine.

use crate::{CloudId, LocalId, ModelName, QueueId};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("remote endpoint is not configured")]
    MissingRemoteUrl,

    #[error("API key is not configured")]
    MissingApiKey,

    #[error("unknown operation mode: {0}")]
    UnknownMode(String),

    // Queue errors
    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(QueueId),

    #[error("queue entry {id} is {state}, expected {expected}")]
    InvalidQueueState {
        id: QueueId,
        state: String,
        expected: String,
    },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown state: {0}")]
    UnknownState(String),

    // Identity errors
    #[error("cloud id {cloud_sync_id} of {model} is already linked to local record {holder}")]
    CloudIdTaken {
        model: ModelName,
        cloud_sync_id: CloudId,
        holder: LocalId,
    },

    #[error("local record {model}/{local_id} is already linked to cloud id {existing}")]
    AlreadyLinked {
        model: ModelName,
        local_id: LocalId,
        existing: CloudId,
    },

    // Migration errors
    #[error("dependency cycle between models: {0:?}")]
    DependencyCycle(Vec<ModelName>),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
