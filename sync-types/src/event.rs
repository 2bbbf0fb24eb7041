//! Events as they flow through the ingestion pipeline.
//!
//! ```text
//! RawEvent ──append──► StoredEvent ──decode──► DecodedEvent
//! (transport)          (event log)             (consumer)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{EventId, SequenceIndex, SessionId, SyncError};

/// The delivery channel an event arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Low-latency, out-of-band delivery triggered by a push notification.
    PushChannel,
    /// The paginated notification stream (authoritative history).
    Stream,
}

impl EventOrigin {
    /// Stable string form, used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::PushChannel => "push_channel",
            EventOrigin::Stream => "stream",
        }
    }
}

impl FromStr for EventOrigin {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push_channel" => Ok(EventOrigin::PushChannel),
            "stream" => Ok(EventOrigin::Stream),
            other => Err(SyncError::InvalidOrigin(other.to_string())),
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as delivered by the transport, possibly still encrypted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Globally unique event id (deduplication key).
    pub id: EventId,
    /// Backend event type, e.g. `conversation.otr-message-add`.
    pub envelope_type: String,
    /// Ciphertext when `is_encrypted`, otherwise the plain event body.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Whether the payload must go through the session provider.
    pub is_encrypted: bool,
    /// Channel the event arrived through.
    pub origin: EventOrigin,
    /// Session of the sending client, required for encrypted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SessionId>,
}

impl RawEvent {
    /// Create a plaintext event.
    pub fn plain(
        id: EventId,
        envelope_type: impl Into<String>,
        payload: Vec<u8>,
        origin: EventOrigin,
    ) -> Self {
        Self {
            id,
            envelope_type: envelope_type.into(),
            payload,
            is_encrypted: false,
            origin,
            sender: None,
        }
    }

    /// Create an encrypted event from the given sender session.
    pub fn encrypted(
        id: EventId,
        envelope_type: impl Into<String>,
        ciphertext: Vec<u8>,
        origin: EventOrigin,
        sender: SessionId,
    ) -> Self {
        Self {
            id,
            envelope_type: envelope_type.into(),
            payload: ciphertext,
            is_encrypted: true,
            origin,
            sender: Some(sender),
        }
    }
}

impl fmt::Debug for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEvent")
            .field("id", &self.id)
            .field("envelope_type", &self.envelope_type)
            .field(
                "payload",
                &format!("[{} bytes REDACTED]", self.payload.len()),
            )
            .field("is_encrypted", &self.is_encrypted)
            .field("origin", &self.origin)
            .field("sender", &self.sender)
            .finish()
    }
}

/// A raw event together with its position in the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Log-assigned, strictly increasing index.
    pub index: SequenceIndex,
    /// The event as it was appended.
    pub event: RawEvent,
}

/// Content of a decoded event.
#[derive(Clone, PartialEq, Eq)]
pub enum DecodedContent {
    /// Decrypted (or pass-through) payload.
    Plaintext(Vec<u8>),
    /// Decryption failed; the event is delivered once as a placeholder.
    Undecryptable {
        /// Why the session provider rejected the ciphertext.
        reason: String,
    },
}

impl fmt::Debug for DecodedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedContent::Plaintext(bytes) => {
                write!(f, "Plaintext([{} bytes REDACTED])", bytes.len())
            }
            DecodedContent::Undecryptable { reason } => f
                .debug_struct("Undecryptable")
                .field("reason", reason)
                .finish(),
        }
    }
}

/// An event ready for the domain consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Event id, unchanged from the raw event.
    pub id: EventId,
    /// Index the event had in the log.
    pub index: SequenceIndex,
    /// Backend event type.
    pub envelope_type: String,
    /// Channel the event arrived through.
    pub origin: EventOrigin,
    /// Sender session, if any.
    pub sender: Option<SessionId>,
    /// Decrypted payload or the undecryptable marker.
    pub content: DecodedContent,
    /// A brand-new session was established with the sender while decoding.
    ///
    /// The sender must be treated as newly discovered and untrusted.
    pub session_was_created: bool,
}

impl DecodedEvent {
    /// Whether this event is the "failed to decrypt" placeholder.
    pub fn is_undecryptable(&self) -> bool {
        matches!(self.content, DecodedContent::Undecryptable { .. })
    }

    /// The plaintext payload, if decoding succeeded.
    pub fn plaintext(&self) -> Option<&[u8]> {
        match &self.content {
            DecodedContent::Plaintext(bytes) => Some(bytes),
            DecodedContent::Undecryptable { .. } => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_string_roundtrip() {
        for origin in [EventOrigin::PushChannel, EventOrigin::Stream] {
            assert_eq!(origin.as_str().parse::<EventOrigin>().unwrap(), origin);
        }
        assert!("carrier".parse::<EventOrigin>().is_err());
    }

    #[test]
    fn raw_event_json_encodes_payload_as_base64() {
        let event = RawEvent::plain(
            EventId::new(),
            "user.update",
            b"hello".to_vec(),
            EventOrigin::Stream,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"], "aGVsbG8=");
        assert_eq!(json["origin"], "stream");
        assert!(json.get("sender").is_none());

        let back: RawEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn raw_event_debug_redacts_payload() {
        let event = RawEvent::encrypted(
            EventId::new(),
            "conversation.otr-message-add",
            vec![0xAB; 12],
            EventOrigin::PushChannel,
            SessionId::new("bob:c2"),
        );
        let debug = format!("{:?}", event);
        assert!(debug.contains("12 bytes REDACTED"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn decoded_event_accessors() {
        let decoded = DecodedEvent {
            id: EventId::new(),
            index: SequenceIndex::new(3),
            envelope_type: "conversation.otr-message-add".into(),
            origin: EventOrigin::Stream,
            sender: None,
            content: DecodedContent::Undecryptable {
                reason: "bad mac".into(),
            },
            session_was_created: false,
        };
        assert!(decoded.is_undecryptable());
        assert!(decoded.plaintext().is_none());
    }
}
