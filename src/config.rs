//! Configuration for the coordination core.
//!
//! Supports a YAML file and environment variable overrides.

use std::path::Path;

use serde::Deserialize;

use crate::billing::PaymentMethod;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "GARAGE_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the sled database.
    pub path: String,
    /// Delete the database when the store is dropped.
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/garage.db".to_string(),
            temporary: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Tax applied on invoice subtotals, in basis points.
    pub tax_rate_bps: u32,
    pub default_method: PaymentMethod,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| "garage.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            self.storage.path = path;
        }

        if let Ok(rate) = std::env::var("TAX_RATE_BPS") {
            self.billing.tax_rate_bps = rate
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TAX_RATE_BPS".to_string(), rate))?;
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(String, String),
}
