//! Ingestion pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Records per committed transaction
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// What to do with the in-flight batch when the dump fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorPolicy {
    /// Commit everything parsed so far, then stop
    #[default]
    Commit,
    /// Roll back the in-flight batch, keeping only completed batches
    Rollback,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Handling of the in-flight batch on a parse error
    #[serde(default)]
    pub on_parse_error: ParseErrorPolicy,
    /// Checkpoint file written after every commit
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            on_parse_error: ParseErrorPolicy::Commit,
            checkpoint_path: None,
        }
    }
}
