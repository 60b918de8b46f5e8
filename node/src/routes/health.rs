//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use possync_engine::OperationMode;
use serde::Serialize;

use crate::dispatcher::SyncStatus;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub mode: OperationMode,
    pub sync_status: SyncStatus,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.dispatcher.config();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: config.node_id,
        mode: config.operation_mode,
        sync_status: state.dispatcher.status().status,
    })
}

/// Root handler.
async fn root() -> &'static str {
    "POS Sync Node"
}
