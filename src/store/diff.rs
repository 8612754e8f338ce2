//! Append-only change log store

use super::{all_rows, ensure_schema, row_count, StoreOp, StoreResultExt, StoredPage, DIFF_TABLE_SQL};
use crate::import::{ImportError, PageRecord};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use tracing::info;

/// Diff store: every accepted change becomes a new row, nothing is updated
pub struct DiffStore {
    conn: Connection,
    path: PathBuf,
}

impl DiffStore {
    /// Open or create the database file and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).during(StoreOp::Open)?;
        if ensure_schema(&conn, DIFF_TABLE_SQL)? {
            info!("Created diff table in {}", path.display());
        }
        Ok(Self { conn, path })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, ImportError> {
        let conn = Connection::open_in_memory().during(StoreOp::Open)?;
        ensure_schema(&conn, DIFF_TABLE_SQL)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Begin a write transaction
    pub fn begin(&mut self) -> Result<DiffBatch<'_>, ImportError> {
        let tx = self.conn.transaction().during(StoreOp::Begin)?;
        Ok(DiffBatch { tx })
    }

    /// All recorded changes in the order they were appended
    pub fn changes(&self) -> Result<Vec<StoredPage>, ImportError> {
        all_rows(&self.conn)
    }

    /// Number of recorded changes
    pub fn change_count(&self) -> Result<usize, ImportError> {
        row_count(&self.conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One open transaction against the diff store
pub struct DiffBatch<'a> {
    tx: Transaction<'a>,
}

impl DiffBatch<'_> {
    /// Record a change
    pub fn append(&self, record: &PageRecord) -> Result<(), ImportError> {
        let mut stmt = self
            .tx
            .prepare_cached("INSERT INTO page (title, rev, ts, text) VALUES (?1, ?2, ?3, ?4)")
            .during(StoreOp::Insert)?;
        stmt.execute(rusqlite::params![
            record.title,
            record.revision_id,
            record.timestamp,
            record.body
        ])
        .during(StoreOp::Insert)?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), ImportError> {
        self.tx.commit().during(StoreOp::Commit)
    }

    pub fn rollback(self) -> Result<(), ImportError> {
        self.tx.rollback().during(StoreOp::Rollback)
    }
}
