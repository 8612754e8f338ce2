//! SQLite-backed page storage
//!
//! Two stores share the `page` table layout:
//! - [`PageStore`]: authoritative snapshot, one row per title, updated in place
//! - [`DiffStore`]: append-only change log, a title may appear many times
//!
//! Both hand out batch handles wrapping a single open write transaction so
//! the ingestion loop controls exactly when work becomes durable.

mod diff;
mod page;

pub use diff::{DiffBatch, DiffStore};
pub use page::{PageBatch, PageStore};

use crate::import::ImportError;
use rusqlite::{Connection, OptionalExtension};
use std::fmt;

/// Snapshot table: title is the natural key
pub(crate) const PAGE_TABLE_SQL: &str = "
CREATE TABLE page (
    id      INTEGER PRIMARY KEY,
    title   VARCHAR NOT NULL UNIQUE,
    rev     INTEGER NOT NULL,
    ts      VARCHAR NOT NULL,
    text    VARCHAR NOT NULL,
    ptext   VARCHAR
)";

/// Change log table: same columns, titles repeat
pub(crate) const DIFF_TABLE_SQL: &str = "
CREATE TABLE page (
    id      INTEGER PRIMARY KEY,
    title   VARCHAR NOT NULL,
    rev     INTEGER NOT NULL,
    ts      VARCHAR NOT NULL,
    text    VARCHAR NOT NULL,
    ptext   VARCHAR
)";

pub(crate) const TABLE_NAME: &str = "page";

/// Store operation that failed, reported in fatal diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Open,
    CheckSchema,
    CreateSchema,
    Configure,
    Begin,
    Commit,
    Rollback,
    Query,
    Insert,
    Update,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::CheckSchema => "schema check",
            Self::CreateSchema => "schema creation",
            Self::Configure => "configure",
            Self::Begin => "transaction begin",
            Self::Commit => "transaction commit",
            Self::Rollback => "transaction rollback",
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag a rusqlite result with the operation that produced it
pub(crate) trait StoreResultExt<T> {
    fn during(self, op: StoreOp) -> Result<T, ImportError>;
}

impl<T> StoreResultExt<T> for rusqlite::Result<T> {
    fn during(self, op: StoreOp) -> Result<T, ImportError> {
        self.map_err(|source| ImportError::Store { op, source })
    }
}

/// What the page store currently knows about a title
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRevision {
    /// Surrogate row id
    pub id: i64,
    /// Last stored revision id
    pub revision_id: u64,
    /// Last stored revision timestamp
    pub timestamp: String,
}

/// Full row of the `page` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub id: i64,
    pub title: String,
    pub revision_id: u64,
    pub timestamp: String,
    pub body: String,
    /// Reserved column, never written by ingestion
    pub previous_body: Option<String>,
}

impl StoredPage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            revision_id: row.get(2)?,
            timestamp: row.get(3)?,
            body: row.get(4)?,
            previous_body: row.get(5)?,
        })
    }
}

/// Check whether a table exists in the database
pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, ImportError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .during(StoreOp::CheckSchema)?;
    Ok(count != 0)
}

/// Create the `page` table with the given DDL unless it already exists
pub(crate) fn ensure_schema(conn: &Connection, ddl: &str) -> Result<bool, ImportError> {
    if table_exists(conn, TABLE_NAME)? {
        return Ok(false);
    }
    conn.execute_batch(ddl).during(StoreOp::CreateSchema)?;
    Ok(true)
}

/// Read every row of the `page` table in id order
pub(crate) fn all_rows(conn: &Connection) -> Result<Vec<StoredPage>, ImportError> {
    let mut stmt = conn
        .prepare("SELECT id, title, rev, ts, text, ptext FROM page ORDER BY id")
        .during(StoreOp::Query)?;
    let rows = stmt
        .query_map([], StoredPage::from_row)
        .during(StoreOp::Query)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .during(StoreOp::Query)?;
    Ok(rows)
}

/// Count rows of the `page` table
pub(crate) fn row_count(conn: &Connection) -> Result<usize, ImportError> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM page", [], |row| row.get(0))
        .during(StoreOp::Query)?;
    Ok(count as usize)
}

/// Fetch the full row for a title from the snapshot table
pub(crate) fn find_page(conn: &Connection, title: &str) -> Result<Option<StoredPage>, ImportError> {
    conn.query_row(
        "SELECT id, title, rev, ts, text, ptext FROM page WHERE title = ?1",
        [title],
        StoredPage::from_row,
    )
    .optional()
    .during(StoreOp::Query)
}
