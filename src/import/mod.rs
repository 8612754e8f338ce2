//! Incremental dump ingestion
//!
//! Streams page records out of a dump, decides for each one whether it is
//! new, changed or unchanged relative to the page store, and commits the
//! resulting writes in fixed-size batches.
//!
//! # Example Usage
//!
//! ```no_run
//! use wikisync::import::{IngestCoordinatorBuilder, WikimediaSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = WikimediaSource::open("enwiki-latest-pages-articles.xml.bz2")?;
//!
//! let mut coordinator = IngestCoordinatorBuilder::new("wiki.db")
//!     .with_diff_db(Some("diff.db"))
//!     .with_batch_size(1000)
//!     .build()?;
//!
//! let stats = coordinator.ingest(source)?;
//! println!("{} records", stats.records_processed);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   PageRecord   ┌──────────────────┐
//! │  RecordSource    │ ─────────────▶ │    classify()    │ ◀── lookup in the
//! │ (WikimediaSource)│                │ Insert/Update/   │     open PageBatch
//! └──────────────────┘                │ Unchanged        │
//!                                     └────────┬─────────┘
//!                                              ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     IngestCoordinator                          │
//! │  one PageBatch (+ one DiffBatch) open, commit every batch_size │
//! └────────────────────────────────────────────────────────────────┘
//!          │                       │                       │
//!          ▼                       ▼                       ▼
//!     PageStore               DiffStore             IngestProgress
//!  (update in place)        (append only)       (heartbeat + summary)
//! ```

pub mod classify;
pub mod coordinator;
pub mod progress;
pub mod source;
pub mod wikimedia;

// Re-export main types
pub use classify::{classify, Change, RevisionLookup};
pub use coordinator::{IngestCoordinator, IngestCoordinatorBuilder};
pub use progress::{print_summary, IngestProgress};
pub use source::{
    DumpCompression, ImportError, IngestCheckpoint, IngestEnd, IngestStats, PageRecord,
    RecordSource, VecSource,
};
pub use wikimedia::WikimediaSource;
