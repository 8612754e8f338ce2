//! Page store and diff store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Primary SQLite database holding the latest revision per page
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Optional append-only database receiving every accepted change
    #[serde(default)]
    pub diff_db_path: Option<PathBuf>,
    /// Page cache size hint in KiB applied before ingestion (0 = engine default)
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("wiki.db")
}

fn default_cache_size_kib() -> u32 {
    256 * 1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            diff_db_path: None,
            cache_size_kib: default_cache_size_kib(),
        }
    }
}
