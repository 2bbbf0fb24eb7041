//! Durable event log.
//!
//! Raw events are appended as they arrive from either delivery channel and
//! stay in the log until the batch containing them has been decoded and
//! handed to the consumer. Every entry gets a [`SequenceIndex`] that is
//! strictly increasing and never reused.
//!
//! The log also persists the set of event ids delivered through the push
//! channel, so deduplication survives restarts.

mod sqlite;

pub use sqlite::SqliteEventLog;

use async_trait::async_trait;
use std::path::PathBuf;
use sync_types::{EventId, RawEvent, SequenceIndex, StoredEvent};

/// Event log errors.
///
/// Any of these is fatal for the operation that returned it: proceeding
/// could lose events or deliver them twice.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned back into an event.
    #[error("corrupt event at index {index}: {reason}")]
    Corrupt {
        /// Index of the offending row.
        index: i64,
        /// What was wrong with it.
        reason: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Append-only, crash-safe store of raw events.
///
/// `append` may be called from other tasks while a batch read with
/// `next_batch` is being processed; new events are queued behind it.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append events, returning their indices in order.
    async fn append(&self, events: &[RawEvent]) -> Result<Vec<SequenceIndex>, StorageError>;

    /// Up to `max` unacknowledged events, oldest first.
    async fn next_batch(&self, max: usize) -> Result<Vec<StoredEvent>, StorageError>;

    /// Delete every entry with an index `<= up_to`.
    ///
    /// Returns the number of deleted entries.
    async fn acknowledge(&self, up_to: SequenceIndex) -> Result<u64, StorageError>;

    /// Acknowledge a delivered batch and record the push ids it delivered,
    /// in one transaction.
    async fn commit_batch(
        &self,
        up_to: SequenceIndex,
        push_ids: &[EventId],
    ) -> Result<(), StorageError>;

    /// Ids recorded by [`commit_batch`](Self::commit_batch).
    async fn seen_push_events(&self) -> Result<Vec<EventId>, StorageError>;

    /// Forget all recorded push ids.
    async fn clear_seen_push_events(&self) -> Result<(), StorageError>;

    /// Number of unacknowledged events.
    async fn pending_count(&self) -> Result<u64, StorageError>;
}
