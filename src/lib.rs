//! WikiSync: incremental loader for Wikimedia XML dumps
//!
//! Streams page records out of a (possibly bzip2-compressed) dump and keeps
//! the latest revision of every page in a SQLite table:
//! - Change classification against the live transaction (insert, update, unchanged)
//! - Fixed-size batched commits with crash safety at batch granularity
//! - Optional append-only diff store mirroring every accepted change
//! - Cancellation, checkpoints and resume for very large dumps

pub mod config;
pub mod import;
pub mod store;

pub use config::Config;
