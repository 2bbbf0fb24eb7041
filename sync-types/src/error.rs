//! Error types for courier-sync.

use thiserror::Error;

/// Errors that can occur while handling sync types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid event origin discriminator
    #[error("invalid event origin: {0}")]
    InvalidOrigin(String),

    /// Invalid identifier format
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A page payload did not match the expected shape
    #[error("invalid page payload: {0}")]
    Payload(#[from] serde_json::Error),
}
