//! Change classification of incoming records against stored state

use super::source::ImportError;
use crate::store::{PageBatch, StoredRevision};

/// Decision for one incoming record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Title not stored yet
    Insert,
    /// Title stored with a different revision id
    Update {
        /// Surrogate id of the row that will be rewritten
        id: i64,
        /// Revision id being replaced
        previous_revision: u64,
    },
    /// Title stored with this exact revision id; nothing to write
    Unchanged,
}

impl Change {
    /// Whether the decision produces writes
    pub fn is_write(&self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

/// Point-in-time view of stored revisions by title
pub trait RevisionLookup {
    fn lookup(&self, title: &str) -> Result<Option<StoredRevision>, ImportError>;
}

impl RevisionLookup for PageBatch<'_> {
    fn lookup(&self, title: &str) -> Result<Option<StoredRevision>, ImportError> {
        PageBatch::lookup(self, title)
    }
}

/// Classify a record by title and revision id.
///
/// Only equality of revision ids is checked. A dump that lists an older
/// revision after a newer one moves the stored row backwards.
pub fn classify<L: RevisionLookup + ?Sized>(
    view: &L,
    title: &str,
    revision_id: u64,
) -> Result<Change, ImportError> {
    let change = match view.lookup(title)? {
        None => Change::Insert,
        Some(stored) if stored.revision_id == revision_id => Change::Unchanged,
        Some(stored) => Change::Update {
            id: stored.id,
            previous_revision: stored.revision_id,
        },
    };
    Ok(change)
}
