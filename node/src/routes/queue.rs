//! Queue inspection and dead-letter handling.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use possync_engine::{QueueId, QueueRecord, QueueState, QueueStats};
use serde::{Deserialize, Serialize};

use crate::auth::AdminAuth;
use crate::error::Result;
use crate::AppState;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Create queue routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queue/stats", get(stats_handler))
        .route("/queue/dead", get(dead_handler))
        .route("/queue/dead/requeue", post(requeue_dead_handler))
        .route("/queue/{id}/requeue", post(requeue_handler))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// `entry` is absent when the requeued row folded into a newer open entry
/// for the same record.
#[derive(Serialize)]
pub struct RequeuedEntry {
    pub id: QueueId,
    pub entry: Option<QueueRecord>,
}

#[derive(Serialize)]
pub struct RequeueResponse {
    pub requeued: usize,
}

/// GET /queue/stats - Entry counts per state.
async fn stats_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Result<Json<QueueStats>> {
    Ok(Json(state.queue.stats().await?))
}

/// GET /queue/dead - Dead-lettered entries with their last error.
async fn dead_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<QueueRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.queue.list(QueueState::Dead, limit).await?))
}

/// POST /queue/{id}/requeue - Give one dead or failed entry a fresh budget.
async fn requeue_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<QueueId>,
) -> Result<Json<RequeuedEntry>> {
    state.queue.requeue(id).await?;
    tracing::info!(queue_id = id, "Queue entry requeued");
    let entry = state.queue.get(id).await?;
    Ok(Json(RequeuedEntry { id, entry }))
}

/// POST /queue/dead/requeue - Requeue every dead entry.
async fn requeue_dead_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Result<Json<RequeueResponse>> {
    let requeued = state.queue.requeue_dead().await?;
    tracing::info!(requeued, "Dead entries requeued");
    Ok(Json(RequeueResponse { requeued }))
}
