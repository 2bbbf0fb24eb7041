//! Notification stream sync.
//!
//! Pages through `GET /notifications?size=N&since=<id>` and publishes the
//! events it finds as [`StreamUpdate`]s on a channel. The engine appends
//! them to the event log.
//!
//! Two flavours share the implementation:
//!
//! - [`NotificationSync::stream`] catches up on the stream when asked to
//!   (at start-up and after [`NotificationSync::request_refresh`]). Its
//!   events carry [`EventOrigin::Stream`]. Reaching the last page emits
//!   [`StreamUpdate::CaughtUp`].
//! - [`NotificationSync::push`] only runs while a [`PushFetchStatus`] has
//!   announced events to fetch. Its events carry
//!   [`EventOrigin::PushChannel`] and it reports progress back to the status.
//!
//! A `404` means the backend no longer holds every notification since the
//! cursor. The page is still processed and [`StreamUpdate::Gap`] is emitted
//! ahead of its events.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::{
    DecodedPage, PageDecoder, PageError, Paginator, PaginatorStatus, PushFetchStatus,
    RequestSource, RequestTicket, ScheduledRequest,
};
use sync_types::{EventId, EventOrigin, NotificationPage, RawEvent, Response, SessionId};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;

const STATUS_NOT_FOUND: u16 = 404;
const OTR_MESSAGE_ADD: &str = "conversation.otr-message-add";
const OTR_ASSET_ADD: &str = "conversation.otr-asset-add";

/// Something the notification sync wants the application to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Events fetched from one page, to be appended to the event log.
    Events {
        /// The events, in stream order.
        events: Vec<RawEvent>,
        /// Whether more pages follow.
        has_more: bool,
        /// The stream cursor after this page, if the page moved it.
        ///
        /// Safe to persist once `events` are in the event log.
        cursor: Option<EventId>,
    },
    /// Notifications were lost; a potential-gap marker should be shown.
    Gap,
    /// The last page was fetched.
    CaughtUp,
    /// The stream could not be fetched.
    Failed,
}

/// Create the channel notification syncs publish on.
pub fn update_channel() -> (UnboundedSender<StreamUpdate>, UnboundedReceiver<StreamUpdate>) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Events of one notification page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationBatch {
    /// Raw events, one per notification payload entry.
    pub events: Vec<RawEvent>,
    /// Newest notification id that can serve as a cursor.
    pub latest_event_id: Option<EventId>,
    /// The backend reported lost notifications.
    pub gap: bool,
}

/// Turns notification pages into raw events.
#[derive(Debug)]
pub struct NotificationPageDecoder {
    origin: EventOrigin,
    last_event_id: Option<EventId>,
}

impl NotificationPageDecoder {
    /// Create a decoder tagging events with `origin`.
    pub fn new(origin: EventOrigin, last_event_id: Option<EventId>) -> Self {
        Self {
            origin,
            last_event_id,
        }
    }

    /// Id of the newest persistent notification seen so far.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }
}

impl PageDecoder for NotificationPageDecoder {
    type Page = NotificationBatch;

    fn decode(&mut self, response: &Response) -> Result<DecodedPage<NotificationBatch>, PageError> {
        let gap = response.status == STATUS_NOT_FOUND;
        let page = match &response.payload {
            Some(payload) => NotificationPage::from_payload(payload)
                .map_err(|e| PageError::Malformed(e.to_string()))?,
            None if gap => NotificationPage {
                notifications: Vec::new(),
                has_more: false,
                time: None,
            },
            None => return Err(PageError::Malformed("missing body".into())),
        };

        let origin = self.origin;
        let events = page
            .notifications
            .iter()
            .flat_map(move |notification| {
                notification
                    .payload
                    .iter()
                    .map(move |entry| raw_event(notification.id, entry, origin))
            })
            .collect();

        let latest_event_id = page.last_persistent_id();
        // After a 404 the page cannot be trusted as a cursor.
        if let Some(latest) = latest_event_id.filter(|_| !gap) {
            self.last_event_id = Some(latest);
        }

        Ok(DecodedPage {
            page: NotificationBatch {
                events,
                latest_event_id,
                gap,
            },
            has_more: page.has_more,
            next_token: self.last_event_id.map(|id| id.to_string()),
        })
    }

    fn should_parse_error(&mut self, response: &Response) -> bool {
        response.status == STATUS_NOT_FOUND
    }
}

fn raw_event(id: EventId, entry: &Value, origin: EventOrigin) -> RawEvent {
    let envelope_type = entry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let cipher_field = match envelope_type.as_str() {
        OTR_MESSAGE_ADD => "text",
        OTR_ASSET_ADD => "key",
        _ => {
            let payload = serde_json::to_vec(entry).unwrap_or_default();
            return RawEvent::plain(id, envelope_type, payload, origin);
        }
    };

    let sender = entry.get("from").and_then(Value::as_str).zip(
        entry
            .pointer("/data/sender")
            .and_then(Value::as_str),
    );
    let ciphertext = entry
        .get("data")
        .and_then(|data| data.get(cipher_field))
        .and_then(Value::as_str)
        .and_then(|encoded| STANDARD.decode(encoded).ok());

    match (sender, ciphertext) {
        (Some((user, client)), Some(ciphertext)) => RawEvent::encrypted(
            id,
            envelope_type,
            ciphertext,
            origin,
            SessionId::for_client(user, client),
        ),
        _ => {
            warn!(event_id = %id, %envelope_type, "Malformed encrypted notification");
            // Without a sender the decoder delivers it as undecryptable.
            RawEvent {
                id,
                envelope_type,
                payload: serde_json::to_vec(entry).unwrap_or_default(),
                is_encrypted: true,
                origin,
                sender: None,
            }
        }
    }
}

enum Trigger {
    OnDemand { refresh_requested: bool },
    PushStatus(Arc<Mutex<PushFetchStatus>>),
}

/// A request source fetching the notification stream.
pub struct NotificationSync {
    paginator: Paginator<NotificationPageDecoder>,
    trigger: Trigger,
    updates: UnboundedSender<StreamUpdate>,
}

impl NotificationSync {
    /// Catch up on the stream from `last_event_id`.
    ///
    /// The first fetch happens as soon as the source is polled.
    pub fn stream(
        config: &StreamConfig,
        last_event_id: Option<EventId>,
        updates: UnboundedSender<StreamUpdate>,
    ) -> Self {
        Self::new(
            config,
            EventOrigin::Stream,
            last_event_id,
            Trigger::OnDemand {
                refresh_requested: true,
            },
            updates,
        )
    }

    /// Fetch the stream while `status` has announced events.
    pub fn push(
        config: &StreamConfig,
        status: Arc<Mutex<PushFetchStatus>>,
        updates: UnboundedSender<StreamUpdate>,
    ) -> Self {
        let last_event_id = lock(&status).last_event_id();
        Self::new(
            config,
            EventOrigin::PushChannel,
            last_event_id,
            Trigger::PushStatus(status),
            updates,
        )
    }

    fn new(
        config: &StreamConfig,
        origin: EventOrigin,
        last_event_id: Option<EventId>,
        trigger: Trigger,
        updates: UnboundedSender<StreamUpdate>,
    ) -> Self {
        let mut paginator = Paginator::new(
            config.base_path.clone(),
            config.start_key.clone(),
            config.page_size,
            NotificationPageDecoder::new(origin, last_event_id),
        )
        .with_start_token(last_event_id.map(|id| id.to_string()));
        if let Some(client) = &config.client_id {
            paginator = paginator.with_query("client", client.clone());
        }
        Self {
            paginator,
            trigger,
            updates,
        }
    }

    /// Fetch the stream again on the next poll.
    ///
    /// Has no effect on a push-triggered sync.
    pub fn request_refresh(&mut self) {
        if let Trigger::OnDemand { refresh_requested } = &mut self.trigger {
            *refresh_requested = true;
        }
    }

    /// Id of the newest persistent notification fetched.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.paginator.decoder().last_event_id()
    }

    /// Whether a page is being fetched or more pages follow.
    pub fn is_fetching(&self) -> bool {
        self.paginator.status() == PaginatorStatus::InProgress
    }

    /// The next page request, if the stream should be fetched now.
    pub fn next_request(&mut self) -> Option<ScheduledRequest> {
        let wants_fetch = match &mut self.trigger {
            Trigger::OnDemand { refresh_requested } => std::mem::take(refresh_requested),
            Trigger::PushStatus(status) => lock(status).has_events_to_fetch(),
        };
        // Restart only when neither in progress nor more pages to fetch.
        if wants_fetch && !self.paginator.has_more_to_fetch() {
            self.paginator.reset_fetching();
        }
        self.paginator.next_request()
    }

    /// Handle the response to a page request.
    pub fn handle_response(&mut self, ticket: RequestTicket, response: &Response) {
        let previous = self.last_event_id();
        match self.paginator.handle_response(ticket, response) {
            None => {}
            Some(Ok(page)) => {
                let cursor = self.last_event_id().filter(|id| Some(*id) != previous);
                self.did_fetch_page(page, cursor)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Notification stream fetch failed");
                if let Trigger::PushStatus(status) = &self.trigger {
                    lock(status).did_fail_to_fetch();
                }
                self.emit(StreamUpdate::Failed);
            }
        }
    }

    fn did_fetch_page(&mut self, page: DecodedPage<NotificationBatch>, cursor: Option<EventId>) {
        let finished = !self.paginator.has_more_to_fetch();
        let NotificationBatch {
            events,
            latest_event_id,
            gap,
        } = page.page;

        if gap {
            warn!("Notification stream has a gap");
            self.emit(StreamUpdate::Gap);
        }

        let event_ids: Vec<EventId> = events.iter().map(|event| event.id).collect();
        debug!(events = events.len(), finished, "Fetched notification page");
        if !events.is_empty() || cursor.is_some() {
            self.emit(StreamUpdate::Events {
                events,
                has_more: !finished,
                cursor,
            });
        }

        match &self.trigger {
            Trigger::PushStatus(status) => {
                lock(status).did_fetch(&event_ids, latest_event_id, finished);
            }
            Trigger::OnDemand { .. } if finished => {
                info!(last_event_id = ?self.last_event_id(), "Notification stream caught up");
                self.emit(StreamUpdate::CaughtUp);
            }
            Trigger::OnDemand { .. } => {}
        }
    }

    fn emit(&self, update: StreamUpdate) {
        if self.updates.send(update).is_err() {
            warn!("Stream update dropped: receiver closed");
        }
    }
}

impl RequestSource for NotificationSync {
    fn next_request(&mut self) -> Option<ScheduledRequest> {
        NotificationSync::next_request(self)
    }

    fn handle_response(&mut self, ticket: RequestTicket, response: &Response) {
        NotificationSync::handle_response(self, ticket, response)
    }
}

impl std::fmt::Debug for NotificationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let trigger = match &self.trigger {
            Trigger::OnDemand { .. } => "on_demand",
            Trigger::PushStatus(_) => "push_status",
        };
        f.debug_struct("NotificationSync")
            .field("trigger", &trigger)
            .field("status", &self.paginator.status())
            .field("last_event_id", &self.last_event_id())
            .finish()
    }
}

fn lock(status: &Mutex<PushFetchStatus>) -> MutexGuard<'_, PushFetchStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_core::PushFetchResult;

    fn page(ids: &[EventId], has_more: bool) -> Value {
        let notifications: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id.to_string(),
                    "payload": [{"type": "user.update", "user": {"id": "u1"}}]
                })
            })
            .collect();
        json!({"notifications": notifications, "has_more": has_more})
    }

    fn drain(rx: &mut UnboundedReceiver<StreamUpdate>) -> Vec<StreamUpdate> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn first_poll_fetches_from_last_event_id() {
        let (tx, _rx) = update_channel();
        let last = EventId::new();
        let config = StreamConfig {
            client_id: Some("c1".into()),
            ..StreamConfig::default()
        };
        let mut sync = NotificationSync::stream(&config, Some(last), tx);

        let scheduled = sync.next_request().unwrap();
        assert_eq!(scheduled.request.path, "/notifications");
        assert_eq!(scheduled.request.query_value("size"), Some("500"));
        assert_eq!(
            scheduled.request.query_value("since"),
            Some(last.to_string().as_str())
        );
        assert_eq!(scheduled.request.query_value("client"), Some("c1"));

        // one page at a time
        assert!(sync.next_request().is_none());
    }

    #[test]
    fn pages_are_followed_until_caught_up() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);
        let first_ids = [EventId::new(), EventId::new()];
        let second_ids = [EventId::new()];

        let first = sync.next_request().unwrap();
        assert!(first.request.query_value("since").is_none());
        sync.handle_response(first.ticket, &Response::ok(page(&first_ids, true)));

        let second = sync.next_request().unwrap();
        assert_eq!(
            second.request.query_value("since"),
            Some(first_ids[1].to_string().as_str())
        );
        sync.handle_response(second.ticket, &Response::ok(page(&second_ids, false)));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 3);
        assert!(matches!(
            &updates[0],
            StreamUpdate::Events { events, has_more: true, cursor }
                if events.len() == 2 && *cursor == Some(first_ids[1])
        ));
        assert!(matches!(
            &updates[1],
            StreamUpdate::Events { events, has_more: false, cursor }
                if events[0].id == second_ids[0] && *cursor == Some(second_ids[0])
        ));
        assert_eq!(updates[2], StreamUpdate::CaughtUp);
        assert_eq!(sync.last_event_id(), Some(second_ids[0]));

        // idle until asked again
        assert!(sync.next_request().is_none());
        sync.request_refresh();
        let refreshed = sync.next_request().unwrap();
        assert_eq!(
            refreshed.request.query_value("since"),
            Some(second_ids[0].to_string().as_str())
        );
    }

    #[test]
    fn events_carry_stream_origin() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);
        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::ok(page(&[EventId::new()], false)));

        match &drain(&mut rx)[0] {
            StreamUpdate::Events { events, .. } => {
                assert_eq!(events[0].origin, EventOrigin::Stream);
                assert!(!events[0].is_encrypted);
                assert_eq!(events[0].envelope_type, "user.update");
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn transient_notifications_are_not_used_as_cursor() {
        let (tx, _rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);
        let persistent = EventId::new();
        let transient = EventId::new();
        let payload = json!({
            "notifications": [
                {"id": persistent.to_string(), "payload": [{"type": "user.update"}]},
                {"id": transient.to_string(), "transient": true, "payload": [{"type": "user.typing"}]}
            ],
            "has_more": false
        });

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::ok(payload));
        assert_eq!(sync.last_event_id(), Some(persistent));
    }

    #[test]
    fn page_of_transient_notifications_leaves_cursor_unset() {
        let (tx, mut rx) = update_channel();
        let last = EventId::new();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), Some(last), tx);
        let payload = json!({
            "notifications": [
                {"id": EventId::new().to_string(), "transient": true, "payload": [{"type": "user.typing"}]}
            ],
            "has_more": false
        });

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::ok(payload));

        assert!(matches!(&drain(&mut rx)[0], StreamUpdate::Events { cursor: None, .. }));
        assert_eq!(sync.last_event_id(), Some(last));
    }

    #[test]
    fn not_found_emits_gap_before_events_and_keeps_cursor() {
        let (tx, mut rx) = update_channel();
        let last = EventId::new();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), Some(last), tx);
        let newer = EventId::new();

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(
            scheduled.ticket,
            &Response::new(404, Some(page(&[newer], false))),
        );

        let updates = drain(&mut rx);
        assert_eq!(updates[0], StreamUpdate::Gap);
        assert!(matches!(
            &updates[1],
            StreamUpdate::Events { events, cursor: None, .. } if events[0].id == newer
        ));
        assert_eq!(updates[2], StreamUpdate::CaughtUp);
        assert_eq!(sync.last_event_id(), Some(last));
    }

    #[test]
    fn not_found_without_body_is_a_gap() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::status(404));

        assert_eq!(
            drain(&mut rx),
            vec![StreamUpdate::Gap, StreamUpdate::CaughtUp]
        );
    }

    #[test]
    fn permanent_error_reports_failure() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::status(403));

        assert_eq!(drain(&mut rx), vec![StreamUpdate::Failed]);
        assert!(!sync.is_fetching());
    }

    #[test]
    fn transient_error_retries_same_page() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);

        let first = sync.next_request().unwrap();
        sync.handle_response(first.ticket, &Response::transport_failure());
        assert!(drain(&mut rx).is_empty());

        let retry = sync.next_request().unwrap();
        assert_eq!(retry.request, first.request);
    }

    #[test]
    fn encrypted_notifications_are_parsed() {
        let (tx, mut rx) = update_channel();
        let mut sync = NotificationSync::stream(&StreamConfig::default(), None, tx);
        let id = EventId::new();
        let payload = json!({
            "notifications": [{
                "id": id.to_string(),
                "payload": [
                    {
                        "type": OTR_MESSAGE_ADD,
                        "from": "bob",
                        "data": {"sender": "c2", "recipient": "c1", "text": STANDARD.encode(b"sealed")}
                    },
                    {"type": OTR_ASSET_ADD, "from": "bob", "data": {"key": "!!not base64!!"}}
                ]
            }],
            "has_more": false
        });

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::ok(payload));

        let StreamUpdate::Events { events, .. } = &drain(&mut rx)[0] else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, id);
        assert!(events[0].is_encrypted);
        assert_eq!(events[0].payload, b"sealed");
        assert_eq!(events[0].sender, Some(SessionId::for_client("bob", "c2")));
        assert!(events[1].is_encrypted);
        assert!(events[1].sender.is_none());
    }

    #[test]
    fn push_sync_waits_for_announced_events() {
        let (tx, mut rx) = update_channel();
        let status = Arc::new(Mutex::new(PushFetchStatus::default()));
        let mut sync = NotificationSync::push(&StreamConfig::default(), Arc::clone(&status), tx);
        assert!(sync.next_request().is_none());

        let announced = EventId::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        status.lock().unwrap().fetch(
            announced,
            Box::new(move |result| sink.lock().unwrap().push(result)),
        );

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::ok(page(&[announced], false)));

        assert!(!status.lock().unwrap().has_events_to_fetch());
        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Fetched]);
        assert!(sync.next_request().is_none());

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert!(matches!(&updates[0], StreamUpdate::Events { events, .. } if events[0].origin == EventOrigin::PushChannel));
    }

    #[test]
    fn push_sync_failure_releases_waiters() {
        let (tx, mut rx) = update_channel();
        let status = Arc::new(Mutex::new(PushFetchStatus::default()));
        let mut sync = NotificationSync::push(&StreamConfig::default(), Arc::clone(&status), tx);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        status.lock().unwrap().fetch(
            EventId::new(),
            Box::new(move |result| sink.lock().unwrap().push(result)),
        );

        let scheduled = sync.next_request().unwrap();
        sync.handle_response(scheduled.ticket, &Response::status(400));

        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Failed]);
        assert_eq!(drain(&mut rx), vec![StreamUpdate::Failed]);
        assert!(sync.next_request().is_none());
    }
}
