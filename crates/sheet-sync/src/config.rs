use crate::remote::ZoneId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Sync engine configuration.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Remote zone holding the sheet records
    pub zone_name: String,
    /// Owner of the zone
    pub zone_owner: String,
    /// Id of the push subscription for the zone
    pub subscription_id: String,
    /// Initial batch size of each upstream processor
    pub batch_size: usize,
    /// Records requested per change-feed page
    pub fetch_page_size: usize,
    /// Backoff when a transient error carries no retry hint
    pub retry_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            zone_name: "Sheets".into(),
            zone_owner: "__defaultOwner__".into(),
            subscription_id: "sheets-zone-changes".into(),
            batch_size: 400,
            fetch_page_size: 200,
            retry_delay_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn zone(&self) -> ZoneId {
        ZoneId::new(&self.zone_name, &self.zone_owner)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.zone_name.trim().is_empty() {
            return Err(ConfigError::Invalid("zoneName must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batchSize must be at least 1".into()));
        }
        if self.fetch_page_size == 0 {
            return Err(ConfigError::Invalid(
                "fetchPageSize must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}
