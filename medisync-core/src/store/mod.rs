//! Reconciling entity stores.
//!
//! An [`EntityStore`] owns the ordered in-memory collection of one entity type.
//! It applies every mutation locally before the remote call resolves, keeps
//! the result when the call succeeds, and otherwise restores or flags the
//! affected record so nothing the user entered silently disappears.
//!
//! # Record States
//!
//! 1. **Pending** - created locally under a `temp-` id, create in flight
//! 2. **Confirmed** - the server id replaced the temporary one
//! 3. **Errored** - a pending or confirmed record whose last write failed;
//!    `sync_error` and `is_offline` are set and the write is queued for retry
//!
//! Failed writes are announced on [`EntityStore::notices`].

mod engine;
mod merge;
mod pending;
mod selectors;

pub use engine::EntityStore;
pub use merge::MergePolicy;
pub use pending::{PendingOp, PendingQueue};

use serde::{Deserialize, Serialize};

/// Default capacity of each store's notice channel.
pub const DEFAULT_NOTICE_CAPACITY: usize = 64;

/// Per-store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,
}

fn default_notice_capacity() -> usize {
    DEFAULT_NOTICE_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A create failed; the record is kept locally and queued
    SavedOffline,
    /// An update failed; the previous values were restored
    UpdateReverted,
    /// A delete failed; the record was put back
    DeleteRestored,
    /// A write failed after newer local edits; the edits were kept
    StaleCompletion,
    /// A queued write reached the server
    Retried,
}

impl NoticeKind {
    pub fn message(&self) -> &'static str {
        match self {
            NoticeKind::SavedOffline => "Saved locally. Will retry when online.",
            NoticeKind::UpdateReverted => "Update failed. Changes were reverted.",
            NoticeKind::DeleteRestored => "Delete failed. The record was restored.",
            NoticeKind::StaleCompletion => {
                "A save failed after newer edits. Your latest changes were kept."
            }
            NoticeKind::Retried => "Synced with the server.",
        }
    }
}

/// User-facing report of a recovered write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncNotice {
    pub collection: &'static str,
    pub record_id: String,
    pub kind: NoticeKind,
}

impl SyncNotice {
    pub fn message(&self) -> &'static str {
        self.kind.message()
    }
}

impl std::fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.collection, self.record_id, self.message())
    }
}
