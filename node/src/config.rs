//! Configuration management for the node.

use possync_engine::{OperationMode, SyncConfig};
use std::env;
use std::str::FromStr;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin API host address
    pub host: String,
    /// Admin API port
    pub port: u16,
    /// PostgreSQL connection URL; in-memory stores when absent
    pub database_url: Option<String>,
    /// Bearer token required by the admin API, if set
    pub admin_token: Option<String>,
    /// Days a done/dead queue row is kept
    pub queue_retention_days: u32,
    /// Run the migration pipeline before the first cycle
    pub migrate_on_start: bool,
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let node_id = var("SYNC_NODE_ID").unwrap_or_else(|| "pos-node".to_string());
        let node_scope = var("SYNC_NODE_SCOPE").unwrap_or_else(|| "default".to_string());
        let mut sync = SyncConfig::new(node_id, node_scope);
        sync.cloud_url = var("SYNC_CLOUD_URL").map(|url| url.trim_end_matches('/').to_string());
        sync.api_key = var("SYNC_API_KEY");

        if let Some(mode) = var("SYNC_MODE") {
            sync.operation_mode = OperationMode::from_str(&mode)?;
        }
        if let Some(value) = var("SYNC_BATCH_SIZE") {
            sync.batch_size = parse("SYNC_BATCH_SIZE", &value)?;
        }
        if let Some(value) = var("SYNC_INTERVAL_MINUTES") {
            sync.sync_interval_minutes = parse("SYNC_INTERVAL_MINUTES", &value)?;
        }
        if let Some(value) = var("SYNC_RETRY_ATTEMPTS") {
            sync.retry_attempts = parse("SYNC_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("SYNC_TIMEOUT_SECS") {
            sync.sync_timeout_secs = parse("SYNC_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("SYNC_CYCLE_BUDGET_SECS") {
            sync.cycle_budget_secs = parse("SYNC_CYCLE_BUDGET_SECS", &value)?;
        }
        if let Some(models) = var("SYNC_ENABLED_MODELS") {
            for model in models.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                sync.entities.insert(model.to_string(), true);
            }
        }

        let queue_retention_days = match var("SYNC_QUEUE_RETENTION_DAYS") {
            Some(value) => parse("SYNC_QUEUE_RETENTION_DAYS", &value)?,
            None => 30,
        };
        let migrate_on_start = match var("SYNC_MIGRATE_ON_START") {
            Some(value) => parse_bool("SYNC_MIGRATE_ON_START", &value)?,
            None => false,
        };

        Ok(Self {
            host,
            port,
            database_url: var("DATABASE_URL"),
            admin_token: var("SYNC_ADMIN_TOKEN"),
            queue_retention_days,
            migrate_on_start,
            sync,
        })
    }

    /// Retention window of finished queue rows, in milliseconds.
    pub fn queue_retention_millis(&self) -> u64 {
        u64::from(self.queue_retention_days) * 24 * 60 * 60 * 1000
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value {value:?} for {name}")]
    InvalidNumber { name: &'static str, value: String },

    #[error(transparent)]
    Sync(#[from] possync_engine::Error),
}
