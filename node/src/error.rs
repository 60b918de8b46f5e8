//! Unified error handling for the node.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Failure of a sync operation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Network failure, timeout, 5xx or undecodable response. Retried on
    /// the next cycle without consuming retry budget.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote rejected the whole request
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] possync_engine::Error),

    #[error("Sync cycle cancelled")]
    Cancelled,

    #[error("A sync cycle is already running")]
    AlreadyRunning,
}

impl SyncError {
    /// True for failures of the connection rather than the data.
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }

    /// True for failures an operator has to fix before sync can resume.
    pub fn is_configuration(&self) -> bool {
        match self {
            SyncError::Configuration(_) => true,
            SyncError::Engine(e) => matches!(
                e,
                possync_engine::Error::InvalidConfig(_)
                    | possync_engine::Error::MissingRemoteUrl
                    | possync_engine::Error::MissingApiKey
                    | possync_engine::Error::UnknownMode(_)
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            SyncError::Configuration(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

/// Admin API error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] possync_engine::Error),

    #[error("Sync error: {0}")]
    Sync(SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Database(e) => AppError::Database(e),
            SyncError::Engine(possync_engine::Error::QueueEntryNotFound(id)) => {
                AppError::NotFound(format!("queue entry {}", id))
            }
            SyncError::Engine(e) => AppError::Engine(e),
            other => AppError::Sync(other),
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }
            AppError::Sync(SyncError::AlreadyRunning) => (
                StatusCode::CONFLICT,
                "A sync cycle is already running".to_string(),
                None,
            ),
            AppError::Sync(e) => {
                tracing::warn!("Sync error: {}", e);
                let status = if e.is_configuration() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "Sync failed".to_string(), Some(e.to_string()))
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type alias for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
