//! Identity and ordering types for courier-sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// The globally unique identifier of a backend event.
///
/// UUID format (16 bytes). This is the deduplication key shared by the
/// push channel and the notification stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(uuid::Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Create an EventId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this EventId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for EventId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidId(format!("{s}: {e}")))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

/// Position of an event in the durable event log.
///
/// Assigned by the log at insertion time, strictly increasing and never
/// reused, even after acknowledged entries have been deleted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceIndex(u64);

impl SequenceIndex {
    /// Create a new SequenceIndex with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this SequenceIndex.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The index before any event was appended.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the index by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SequenceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceIndex({})", self.0)
    }
}

/// Identifies the cryptographic session of a sender client.
///
/// Conventionally `<user-id>:<client-id>`, but the session provider is the
/// only component that interprets it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a SessionId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the session id for a user's client.
    pub fn for_client(user: &str, client: &str) -> Self {
        Self(format!("{user}:{client}"))
    }

    /// Get the session id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}
