//! Configuration for WikiSync

mod ingest;
mod logging;
mod store;

pub use ingest::{IngestConfig, ParseErrorPolicy, DEFAULT_BATCH_SIZE};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use store::StoreConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest accepted batch; beyond this a single transaction stops bounding memory
const MAX_BATCH_SIZE: usize = 1_000_000;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Storage configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration fields.
    ///
    /// Collects every violation and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.ingest.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.ingest.batch_size > MAX_BATCH_SIZE {
            errors.push(format!("batch_size must be <= {}", MAX_BATCH_SIZE));
        }

        if self.store.db_path.as_os_str().is_empty() {
            errors.push("db_path must not be empty".to_string());
        }
        if let Some(ref diff) = self.store.diff_db_path {
            if diff.as_os_str().is_empty() {
                errors.push("diff_db_path must not be empty when set".to_string());
            } else if *diff == self.store.db_path {
                errors.push("diff_db_path must differ from db_path".to_string());
            }
        }

        if let Some(ref checkpoint) = self.ingest.checkpoint_path {
            if checkpoint.as_os_str().is_empty() {
                errors.push("checkpoint_path must not be empty when set".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }
}
