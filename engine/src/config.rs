//! Node sync configuration.
//!
//! There is exactly one [`SyncConfig`] per node (warehouse). It is built by
//! an operator or an environment loader and checked with
//! [`SyncConfig::validate`] before any cycle uses it.

use crate::{error::Result, Error, ModelName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MIN_BATCH_SIZE: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const MIN_SYNC_INTERVAL_MINUTES: u32 = 1;
pub const MAX_SYNC_INTERVAL_MINUTES: u32 = 1_440;

/// How a node talks to the PRINCIPAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Never contacts the remote; mutations accumulate in the queue
    Offline,
    /// Push and pull, on the timer and on manual trigger
    #[default]
    Hybrid,
    /// Push only, when an operator asks for it
    SyncOnDemand,
}

impl OperationMode {
    /// Whether cycles may reach the network at all.
    pub fn contacts_remote(&self) -> bool {
        !matches!(self, OperationMode::Offline)
    }

    /// Whether remote-originated changes are pulled.
    pub fn pulls(&self) -> bool {
        matches!(self, OperationMode::Hybrid)
    }

    /// Whether the periodic timer starts cycles.
    pub fn runs_on_timer(&self) -> bool {
        matches!(self, OperationMode::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Offline => "offline",
            OperationMode::Hybrid => "hybrid",
            OperationMode::SyncOnDemand => "sync_on_demand",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(OperationMode::Offline),
            "hybrid" => Ok(OperationMode::Hybrid),
            "sync_on_demand" | "on_demand" => Ok(OperationMode::SyncOnDemand),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Sync configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identity of this node
    pub node_id: String,
    /// Warehouse the node's queue entries belong to
    pub node_scope: String,
    /// Base URL of the PRINCIPAL
    pub cloud_url: Option<String>,
    pub api_key: Option<String>,
    pub operation_mode: OperationMode,
    /// Per-entity enable flags
    pub entities: BTreeMap<ModelName, bool>,
    pub batch_size: u32,
    pub sync_interval_minutes: u32,
    /// Attempts before a rejected record is dead-lettered
    pub retry_attempts: u32,
    /// Per-request network timeout
    pub sync_timeout_secs: u64,
    /// Wall-clock budget of one cycle
    pub cycle_budget_secs: u64,
}

impl SyncConfig {
    /// Create a configuration with default limits.
    pub fn new(node_id: impl Into<String>, node_scope: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_scope: node_scope.into(),
            cloud_url: None,
            api_key: None,
            operation_mode: OperationMode::default(),
            entities: BTreeMap::new(),
            batch_size: 100,
            sync_interval_minutes: 5,
            retry_attempts: 3,
            sync_timeout_secs: 30,
            cycle_budget_secs: 300,
        }
    }

    /// Sets the remote endpoint and credentials.
    pub fn with_remote(mut self, cloud_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.cloud_url = Some(cloud_url.into());
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.operation_mode = mode;
        self
    }

    /// Enable or disable sync for a model.
    pub fn with_entity(mut self, model: impl Into<ModelName>, enabled: bool) -> Self {
        self.entities.insert(model.into(), enabled);
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_sync_interval(mut self, minutes: u32) -> Self {
        self.sync_interval_minutes = minutes;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.sync_timeout_secs = secs;
        self
    }

    pub fn with_cycle_budget(mut self, secs: u64) -> Self {
        self.cycle_budget_secs = secs;
        self
    }

    /// Models with sync enabled, in name order.
    pub fn enabled_models(&self) -> Vec<ModelName> {
        self.entities
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(model, _)| model.clone())
            .collect()
    }

    pub fn is_enabled(&self, model: &str) -> bool {
        self.entities.get(model).copied().unwrap_or(false)
    }

    /// Check value ranges and required fields.
    pub fn validate(&self) -> Result<()> {
        if self.node_scope.trim().is_empty() {
            return Err(Error::InvalidConfig("node scope must not be empty".into()));
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::InvalidConfig(format!(
                "batch size {} outside {}..={}",
                self.batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
            )));
        }
        if !(MIN_SYNC_INTERVAL_MINUTES..=MAX_SYNC_INTERVAL_MINUTES)
            .contains(&self.sync_interval_minutes)
        {
            return Err(Error::InvalidConfig(format!(
                "sync interval {} outside {}..={} minutes",
                self.sync_interval_minutes, MIN_SYNC_INTERVAL_MINUTES, MAX_SYNC_INTERVAL_MINUTES
            )));
        }
        if self.retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry attempts must be at least 1".into(),
            ));
        }
        if self.sync_timeout_secs == 0 {
            return Err(Error::InvalidConfig("sync timeout must be positive".into()));
        }
        if self.operation_mode.contacts_remote() {
            self.remote()?;
        }
        Ok(())
    }

    /// Remote URL and API key, or the configuration error explaining which
    /// one is missing.
    pub fn remote(&self) -> Result<(&str, &str)> {
        let url = self
            .cloud_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(Error::MissingRemoteUrl)?;
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(Error::MissingApiKey)?;
        Ok((url, api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SyncConfig {
        SyncConfig::new("pos-1", "WH1").with_remote("https://erp.example.com", "secret")
    }

    #[test]
    fn config_builder() {
        let config = valid()
            .with_batch_size(250)
            .with_sync_interval(15)
            .with_entity("product.product", true)
            .with_entity("res.partner", false)
            .with_entity("product.category", true);

        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 250);
        assert_eq!(
            config.enabled_models(),
            vec!["product.category", "product.product"]
        );
        assert!(!config.is_enabled("res.partner"));
        assert!(!config.is_enabled("loyalty.program"));
    }

    #[test]
    fn batch_size_bounds() {
        assert!(valid().with_batch_size(1).validate().is_ok());
        assert!(valid().with_batch_size(10_000).validate().is_ok());
        assert!(matches!(
            valid().with_batch_size(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            valid().with_batch_size(10_001).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn interval_bounds() {
        assert!(valid().with_sync_interval(1440).validate().is_ok());
        assert!(valid().with_sync_interval(0).validate().is_err());
        assert!(valid().with_sync_interval(1441).validate().is_err());
    }

    #[test]
    fn remote_required_unless_offline() {
        let bare = SyncConfig::new("pos-1", "WH1");
        assert_eq!(bare.validate(), Err(Error::MissingRemoteUrl));
        assert!(bare
            .clone()
            .with_mode(OperationMode::Offline)
            .validate()
            .is_ok());

        let mut no_key = valid();
        no_key.api_key = Some("  ".into());
        assert_eq!(no_key.validate(), Err(Error::MissingApiKey));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(
            "sync_on_demand".parse::<OperationMode>().unwrap(),
            OperationMode::SyncOnDemand
        );
        assert_eq!(
            " Hybrid ".parse::<OperationMode>().unwrap(),
            OperationMode::Hybrid
        );
        assert!("cloud".parse::<OperationMode>().is_err());

        assert!(OperationMode::Hybrid.pulls());
        assert!(!OperationMode::SyncOnDemand.pulls());
        assert!(!OperationMode::SyncOnDemand.runs_on_timer());
        assert!(!OperationMode::Offline.contacts_remote());
    }
}
