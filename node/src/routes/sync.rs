//! Sync cycle control.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::AdminAuth;
use crate::dispatcher::{DispatcherStatus, Trigger};
use crate::error::Result;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/status", get(status_handler))
        .route("/sync/trigger", post(trigger_handler))
        .route("/sync/cancel", post(cancel_handler))
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    /// Run the cycle within the request; otherwise wake the scheduler
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub sync_cancelled: bool,
    pub migration_cancelled: bool,
}

/// GET /sync/status - Dispatcher state and counters.
async fn status_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Json<DispatcherStatus> {
    Json(state.dispatcher.status())
}

/// POST /sync/trigger - Start a manual cycle.
async fn trigger_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<TriggerQuery>,
) -> Result<Response> {
    if !query.wait {
        state.trigger.fire();
        return Ok(StatusCode::ACCEPTED.into_response());
    }
    let report = state.dispatcher.execute_cycle(Trigger::Manual).await?;
    Ok(Json(report).into_response())
}

/// POST /sync/cancel - Stop running work after the in-flight batch.
async fn cancel_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        sync_cancelled: state.dispatcher.cancel(),
        migration_cancelled: state.migration.cancel(),
    })
}
