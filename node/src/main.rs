//! POS Node - offline-first sync agent.
//!
//! Captures local writes into a durable queue, pushes them to the PRINCIPAL
//! when the network is back and, in hybrid mode, pulls remote changes. The
//! admin API reports status and exposes manual control.

use possync_node::config::Config;
use possync_node::migration::MigrationOptions;
use possync_node::store;
use possync_node::{app, Node, Stores};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "possync_node=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    if let Err(e) = config.sync.validate() {
        // Cycles keep failing with the same error until this is fixed.
        tracing::warn!(error = %e, "Sync configuration is invalid");
    }

    tracing::info!(
        node_id = %config.sync.node_id,
        scope = %config.sync.node_scope,
        mode = %config.sync.operation_mode,
        "Starting POS node on {}:{}",
        config.host,
        config.port
    );

    let retries = config.sync.retry_attempts;
    let stores = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = store::create_pool(database_url).await?;
            tracing::info!("Running database migrations...");
            store::run_migrations(&pool).await?;
            Stores::postgres(pool, retries)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, queue and records are kept in memory");
            Stores::memory(retries)
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let migrate_on_start = config.migrate_on_start;
    let Node { state, scheduler } = Node::assemble(config, &stores, None);

    if migrate_on_start {
        let sync = state.dispatcher.config();
        match state.migration.run(&sync, &MigrationOptions::default()).await {
            Ok(report) => tracing::info!(
                created = report.created(),
                updated = report.updated(),
                errors = report.errors(),
                "Startup migration finished"
            ),
            Err(e) => tracing::error!(error = %e, "Startup migration failed"),
        }
    }

    let scheduler = scheduler.spawn();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Admin API listening on {}", addr);
    axum::serve(listener, app(state)).await?;

    scheduler.abort();
    Ok(())
}
