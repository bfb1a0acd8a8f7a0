//! Committed change descriptions broadcast after every successful commit.

use crate::model::entity::{ContextId, EntityId};

/// One row touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedEntity {
    pub id: EntityId,
    pub storage_name: String,
    /// Row version after the commit; `0` for deletions.
    pub version: i64,
}

/// Result of one successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Store-wide commit sequence number, starting at 1. `0` for empty commits.
    pub sequence: u64,
    /// Context that produced the commit.
    pub origin: Option<ContextId>,
    pub inserted: Vec<ChangedEntity>,
    pub updated: Vec<ChangedEntity>,
    pub deleted: Vec<ChangedEntity>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Whether any change in this set targets `storage_name`.
    pub fn touches(&self, storage_name: &str) -> bool {
        self.inserted
            .iter()
            .chain(&self.updated)
            .chain(&self.deleted)
            .any(|change| change.storage_name == storage_name)
    }
}
