//! Admin API route definitions.

mod health;
mod migration;
mod queue;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all admin routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(queue::routes())
        .merge(migration::routes())
}
