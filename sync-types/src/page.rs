//! Notification stream page payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EventId, SyncError};

/// One entry of the notification stream.
///
/// A notification carries one or more backend events that share its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Notification id; also the id of the events it carries.
    pub id: EventId,
    /// Transient notifications are not persisted by the backend and must
    /// never be used as a stream cursor.
    #[serde(default)]
    pub transient: bool,
    /// The backend events, as JSON objects with at least a `type` field.
    #[serde(default)]
    pub payload: Vec<Value>,
}

/// A page of the notification stream (`GET /notifications`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    /// Notifications in stream order.
    #[serde(default)]
    pub notifications: Vec<NotificationEnvelope>,
    /// Whether more pages are available after this one.
    #[serde(default)]
    pub has_more: bool,
    /// Server time at which the page was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl NotificationPage {
    /// Parse a page from a response payload.
    pub fn from_payload(payload: &Value) -> Result<Self, SyncError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Id of the last notification that can serve as the next `since` cursor.
    pub fn last_persistent_id(&self) -> Option<EventId> {
        self.notifications
            .iter()
            .rev()
            .find(|n| !n.transient)
            .map(|n| n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_page_with_defaults() {
        let id = EventId::new();
        let payload = json!({
            "notifications": [
                {"id": id.to_string(), "payload": [{"type": "user.update"}]}
            ]
        });
        let page = NotificationPage::from_payload(&payload).unwrap();
        assert_eq!(page.notifications.len(), 1);
        assert!(!page.has_more);
        assert!(!page.notifications[0].transient);
        assert_eq!(page.time, None);
    }

    #[test]
    fn last_persistent_id_skips_transient() {
        let first = EventId::new();
        let transient = EventId::new();
        let page = NotificationPage {
            notifications: vec![
                NotificationEnvelope {
                    id: first,
                    transient: false,
                    payload: vec![],
                },
                NotificationEnvelope {
                    id: transient,
                    transient: true,
                    payload: vec![],
                },
            ],
            has_more: true,
            time: None,
        };
        assert_eq!(page.last_persistent_id(), Some(first));
    }

    #[test]
    fn empty_page_has_no_cursor() {
        let page = NotificationPage::from_payload(&json!({"has_more": false})).unwrap();
        assert_eq!(page.last_persistent_id(), None);
    }

    #[test]
    fn malformed_page_is_an_error() {
        let err = NotificationPage::from_payload(&json!({"notifications": 5})).unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
        assert!(err.to_string().starts_with("invalid page payload"));
    }
}
