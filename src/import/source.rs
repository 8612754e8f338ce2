//! Core types and traits for dump ingestion

use crate::store::StoreOp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Latest revision of one page as read from a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    /// Page title, the natural key
    pub title: String,
    /// Revision id of the most recent revision
    pub revision_id: u64,
    /// Revision timestamp as written in the dump
    pub timestamp: String,
    /// Revision body text
    pub body: String,
}

impl PageRecord {
    /// Create a new page record
    pub fn new(
        title: impl Into<String>,
        revision_id: u64,
        timestamp: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            revision_id,
            timestamp: timestamp.into(),
            body: body.into(),
        }
    }
}

/// Forward-only producer of page records
pub trait RecordSource: Send {
    /// Iterate over the remaining records.
    ///
    /// An `Err` item means the source cannot continue; the caller stops reading.
    fn iter_records(&mut self) -> Box<dyn Iterator<Item = Result<PageRecord, ImportError>> + '_>;

    /// Get the source name for display
    fn source_name(&self) -> &str;

    /// Identity recorded in checkpoints; resume only trusts a checkpoint with
    /// the same value
    fn source_path(&self) -> PathBuf {
        PathBuf::from(self.source_name())
    }
}

/// In-memory source, mostly useful for tests and replaying fixed record sets
pub struct VecSource {
    name: String,
    records: std::vec::IntoIter<Result<PageRecord, ImportError>>,
}

impl VecSource {
    /// Source yielding the given records in order
    pub fn new(records: Vec<PageRecord>) -> Self {
        Self::from_results(records.into_iter().map(Ok).collect())
    }

    /// Source yielding records and errors in order
    pub fn from_results(records: Vec<Result<PageRecord, ImportError>>) -> Self {
        Self {
            name: "memory".to_string(),
            records: records.into_iter(),
        }
    }
}

impl RecordSource for VecSource {
    fn iter_records(&mut self) -> Box<dyn Iterator<Item = Result<PageRecord, ImportError>> + '_> {
        Box::new(&mut self.records)
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

/// Compression of a dump file, chosen by file name suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpCompression {
    /// `.bz2`, possibly multistream
    Bzip2,
    /// Anything else is read as raw XML
    None,
}

impl DumpCompression {
    /// Detect compression from the file name
    pub fn detect(path: &Path) -> Self {
        let is_bz2 = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(".bz2"))
            .unwrap_or(false);
        if is_bz2 {
            DumpCompression::Bzip2
        } else {
            DumpCompression::None
        }
    }
}

/// How an ingestion run ended
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestEnd {
    /// The source ran out of records
    #[default]
    Exhausted,
    /// The source failed mid-stream
    ParseError(String),
    /// The cancel flag was raised
    Cancelled,
}

/// Ingestion statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    /// Records read from the source, including unchanged ones
    pub records_processed: usize,
    /// Records skipped by resume without classification
    pub records_resumed: usize,
    /// New pages inserted
    pub inserted: usize,
    /// Existing pages moved to a different revision
    pub updated: usize,
    /// Records whose revision was already stored
    pub unchanged: usize,
    /// Rows appended to the diff store
    pub diff_rows: usize,
    /// Transactions committed on the page store
    pub batches_committed: usize,
    /// Heartbeat units written to the terminal
    pub heartbeats: usize,
    /// Processing time in seconds
    pub elapsed_seconds: f64,
    /// Records per second over the whole run
    pub records_per_second: f64,
    /// How the run ended
    pub end: IngestEnd,
}

impl IngestStats {
    /// Calculate records per second
    pub fn update_rate(&mut self) {
        if self.elapsed_seconds > 0.0 {
            self.records_per_second = self.records_processed as f64 / self.elapsed_seconds;
        }
    }

    /// Number of write decisions (inserts plus updates)
    pub fn changes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Checkpoint for resume support
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestCheckpoint {
    /// Source file path
    pub source_path: PathBuf,
    /// Records durably committed, counted from the start of the source
    pub records_committed: usize,
    /// Batches committed in the run that wrote this checkpoint
    pub batches_committed: usize,
    /// Timestamp of checkpoint
    pub timestamp: DateTime<Utc>,
}

impl IngestCheckpoint {
    /// Create a new checkpoint
    pub fn new(source_path: PathBuf, records_committed: usize, batches_committed: usize) -> Self {
        Self {
            source_path,
            records_committed,
            batches_committed,
            timestamp: Utc::now(),
        }
    }

    /// Save checkpoint to file
    pub fn save(&self, path: &Path) -> Result<(), ImportError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load checkpoint from file
    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ImportError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        let checkpoint = serde_json::from_str(&json)?;
        Ok(checkpoint)
    }
}

/// Errors that can occur during ingestion
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Invalid dump format: {0}")]
    InvalidFormat(String),

    #[error("Store error during {op}: {source}")]
    Store {
        op: StoreOp,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<quick_xml::Error> for ImportError {
    fn from(e: quick_xml::Error) -> Self {
        ImportError::XmlParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_record_creation() {
        let record = PageRecord::new("Rust", 42, "2024-01-15T10:30:00Z", "Body");
        assert_eq!(record.title, "Rust");
        assert_eq!(record.revision_id, 42);
        assert_eq!(record.timestamp, "2024-01-15T10:30:00Z");
        assert_eq!(record.body, "Body");
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(
            DumpCompression::detect(Path::new("enwiki-latest-pages-articles.xml.bz2")),
            DumpCompression::Bzip2
        );
        assert_eq!(
            DumpCompression::detect(Path::new("/data/dump.bz2")),
            DumpCompression::Bzip2
        );
        assert_eq!(
            DumpCompression::detect(Path::new("enwiki-latest-pages-articles.xml")),
            DumpCompression::None
        );
        assert_eq!(
            DumpCompression::detect(Path::new("dump.bz2.xml")),
            DumpCompression::None
        );
    }

    #[test]
    fn test_vec_source_yields_in_order() {
        let mut source = VecSource::from_results(vec![
            Ok(PageRecord::new("A", 1, "t", "a")),
            Err(ImportError::XmlParse("boom".into())),
        ]);
        let items: Vec<_> = source.iter_records().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().title, "A");
        assert!(items[1].is_err());
        assert_eq!(source.iter_records().count(), 0);
    }

    #[test]
    fn test_checkpoint_roundtrip_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.checkpoint");
        let checkpoint = IngestCheckpoint::new(PathBuf::from("dump.xml.bz2"), 3000, 3);
        checkpoint.save(&path).unwrap();

        let loaded = IngestCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.source_path, PathBuf::from("dump.xml.bz2"));
        assert_eq!(loaded.records_committed, 3000);
        assert_eq!(loaded.batches_committed, 3);
    }

    #[test]
    fn test_missing_checkpoint_is_checkpoint_error() {
        let tmp = tempfile::tempdir().unwrap();
        match IngestCheckpoint::load(&tmp.path().join("nope")) {
            Err(ImportError::Checkpoint(msg)) => assert!(msg.contains("nope")),
            other => panic!("expected checkpoint error, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_rate() {
        let mut stats = IngestStats {
            records_processed: 500,
            elapsed_seconds: 2.0,
            ..Default::default()
        };
        stats.update_rate();
        assert!((stats.records_per_second - 250.0).abs() < f64::EPSILON);
    }
}
