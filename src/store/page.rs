//! Authoritative page snapshot store

use super::{
    all_rows, ensure_schema, find_page, row_count, StoreOp, StoreResultExt, StoredPage,
    StoredRevision, PAGE_TABLE_SQL,
};
use crate::import::{ImportError, PageRecord};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Page store: one row per title holding the last known revision
pub struct PageStore {
    conn: Connection,
    path: PathBuf,
}

impl PageStore {
    /// Open or create the database file and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).during(StoreOp::Open)?;
        if ensure_schema(&conn, PAGE_TABLE_SQL)? {
            info!("Created page table in {}", path.display());
        }
        Ok(Self { conn, path })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, ImportError> {
        let conn = Connection::open_in_memory().during(StoreOp::Open)?;
        ensure_schema(&conn, PAGE_TABLE_SQL)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Widen the page cache before a bulk load (0 keeps the engine default)
    pub fn set_cache_size_kib(&self, kib: u32) -> Result<(), ImportError> {
        if kib == 0 {
            return Ok(());
        }
        // Negative values are interpreted by SQLite as KiB rather than pages
        self.conn
            .pragma_update(None, "cache_size", -i64::from(kib))
            .during(StoreOp::Configure)?;
        debug!("Page cache set to {} KiB", kib);
        Ok(())
    }

    /// Begin a write transaction
    pub fn begin(&mut self) -> Result<PageBatch<'_>, ImportError> {
        let tx = self.conn.transaction().during(StoreOp::Begin)?;
        Ok(PageBatch { tx })
    }

    /// Fetch the stored row for a title
    pub fn get(&self, title: &str) -> Result<Option<StoredPage>, ImportError> {
        find_page(&self.conn, title)
    }

    /// All stored pages in insertion order
    pub fn pages(&self) -> Result<Vec<StoredPage>, ImportError> {
        all_rows(&self.conn)
    }

    /// Number of stored pages
    pub fn page_count(&self) -> Result<usize, ImportError> {
        row_count(&self.conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One open transaction against the page store
pub struct PageBatch<'a> {
    tx: Transaction<'a>,
}

impl PageBatch<'_> {
    /// Current revision for a title as seen by this transaction
    pub fn lookup(&self, title: &str) -> Result<Option<StoredRevision>, ImportError> {
        let mut stmt = self
            .tx
            .prepare_cached("SELECT id, rev, ts FROM page WHERE title = ?1")
            .during(StoreOp::Query)?;
        let current = stmt
            .query_row([title], |row| {
                Ok(StoredRevision {
                    id: row.get(0)?,
                    revision_id: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })
            .optional()
            .during(StoreOp::Query)?;
        Ok(current)
    }

    /// Append a row for a title seen for the first time
    pub fn insert(&self, record: &PageRecord) -> Result<(), ImportError> {
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

    /// Move an existing title to the record's revision in place
    pub fn update(&self, record: &PageRecord) -> Result<(), ImportError> {
        let mut stmt = self
            .tx
            .prepare_cached("UPDATE page SET rev = ?1, ts = ?2, text = ?3 WHERE title = ?4")
            .during(StoreOp::Update)?;
        stmt.execute(rusqlite::params![
            record.revision_id,
            record.timestamp,
            record.body,
            record.title
        ])
        .during(StoreOp::Update)?;
        Ok(())
    }

    /// Make the batch durable
    pub fn commit(self) -> Result<(), ImportError> {
        self.tx.commit().during(StoreOp::Commit)
    }

    /// Discard the batch
    pub fn rollback(self) -> Result<(), ImportError> {
        self.tx.rollback().during(StoreOp::Rollback)
    }
}
