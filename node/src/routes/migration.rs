//! Master data migration.

use axum::{extract::State, routing::post, Json, Router};
use possync_engine::MigrationManifest;

use crate::auth::AdminAuth;
use crate::error::Result;
use crate::migration::{MigrationOptions, MigrationReport};
use crate::AppState;

/// Create migration routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/migration/manifest", post(manifest_handler))
        .route("/migration/run", post(run_handler))
}

/// POST /migration/manifest - Fetch the PRINCIPAL's manifest.
async fn manifest_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Result<Json<MigrationManifest>> {
    let config = state.dispatcher.config();
    Ok(Json(state.migration.get_manifest(&config).await?))
}

/// POST /migration/run - Migrate master data.
async fn run_handler(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(options): Json<MigrationOptions>,
) -> Result<Json<MigrationReport>> {
    let config = state.dispatcher.config();
    Ok(Json(state.migration.run(&config, &options).await?))
}
