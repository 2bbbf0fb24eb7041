//! Tracking of events announced by push notifications.
//!
//! A push notification only announces that an event exists. The ids are
//! handed to [`PushFetchStatus::fetch`], which switches the status to
//! [`FetchStatus::InProgress`] until the notification stream reports them
//! fetched.
//!
//! ## Example
//!
//! ```
//! use sync_core::{FetchStatus, PushFetchStatus};
//! use sync_types::EventId;
//!
//! let mut status = PushFetchStatus::new(None);
//! let id = EventId::new();
//! status.fetch(id, Box::new(|_| {}));
//! assert_eq!(status.status(), FetchStatus::InProgress);
//!
//! status.did_fetch(&[id], Some(id), true);
//! assert_eq!(status.status(), FetchStatus::Done);
//! ```

use std::collections::BTreeSet;
use std::fmt;
use sync_types::EventId;
use tracing::debug;

/// Whether announced events are still waiting to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Nothing left to fetch.
    Done,
    /// Announced events have not been fetched yet.
    InProgress,
}

/// How a wait for announced events ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFetchResult {
    /// Every announced event was fetched.
    Fetched,
    /// The stream could not be fetched.
    Failed,
}

/// Called once the announced events were fetched or fetching failed.
pub type FetchCompletion = Box<dyn FnOnce(PushFetchResult) + Send>;

/// Event ids announced through push notifications and not yet fetched.
pub struct PushFetchStatus {
    to_fetch: BTreeSet<EventId>,
    completions: Vec<FetchCompletion>,
    last_event_id: Option<EventId>,
}

impl PushFetchStatus {
    /// Create a status, given the id of the last event already fetched.
    pub fn new(last_event_id: Option<EventId>) -> Self {
        Self {
            to_fetch: BTreeSet::new(),
            completions: Vec::new(),
            last_event_id,
        }
    }

    /// Current status.
    pub fn status(&self) -> FetchStatus {
        if self.to_fetch.is_empty() {
            FetchStatus::Done
        } else {
            FetchStatus::InProgress
        }
    }

    /// Whether announced events are waiting to be fetched.
    pub fn has_events_to_fetch(&self) -> bool {
        self.status() == FetchStatus::InProgress
    }

    /// Id of the most recent event reported fetched.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }

    /// Request that `event_id` be fetched.
    ///
    /// If it is the last event already fetched, `completion` runs right away.
    pub fn fetch(&mut self, event_id: EventId, completion: FetchCompletion) {
        if self.last_event_id == Some(event_id) {
            debug!(%event_id, "Announced event already fetched");
            completion(PushFetchResult::Fetched);
            return;
        }
        debug!(%event_id, "Announced event queued for fetching");
        self.to_fetch.insert(event_id);
        self.completions.push(completion);
    }

    /// Record events fetched from the stream.
    ///
    /// `last_event_id` is the newest persistent event of the page and counts
    /// as fetched. Completions run once nothing is left and `finished` is set.
    pub fn did_fetch(&mut self, event_ids: &[EventId], last_event_id: Option<EventId>, finished: bool) {
        for id in event_ids {
            self.to_fetch.remove(id);
        }
        if let Some(last) = last_event_id {
            self.to_fetch.remove(&last);
            self.last_event_id = Some(last);
        }
        if finished && self.to_fetch.is_empty() {
            self.complete(PushFetchResult::Fetched);
        }
    }

    /// Give up on every announced event.
    pub fn did_fail_to_fetch(&mut self) {
        self.to_fetch.clear();
        self.complete(PushFetchResult::Failed);
    }

    fn complete(&mut self, result: PushFetchResult) {
        for completion in self.completions.drain(..) {
            completion(result);
        }
    }
}

impl Default for PushFetchStatus {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for PushFetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushFetchStatus")
            .field("to_fetch", &self.to_fetch)
            .field("completions", &self.completions.len())
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<PushFetchResult>>>, FetchCompletion) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (
            results,
            Box::new(move |result| sink.lock().unwrap().push(result)),
        )
    }

    #[test]
    fn starts_done() {
        let status = PushFetchStatus::default();
        assert_eq!(status.status(), FetchStatus::Done);
        assert!(!status.has_events_to_fetch());
    }

    #[test]
    fn fetch_marks_in_progress() {
        let mut status = PushFetchStatus::default();
        status.fetch(EventId::new(), Box::new(|_| {}));
        assert_eq!(status.status(), FetchStatus::InProgress);
    }

    #[test]
    fn in_progress_until_all_ids_fetched() {
        let mut status = PushFetchStatus::default();
        let first = EventId::new();
        let second = EventId::new();
        status.fetch(first, Box::new(|_| {}));
        status.fetch(second, Box::new(|_| {}));

        status.did_fetch(&[first], Some(first), true);
        assert_eq!(status.status(), FetchStatus::InProgress);
    }

    #[test]
    fn done_after_fetch() {
        let mut status = PushFetchStatus::default();
        let id = EventId::new();
        status.fetch(id, Box::new(|_| {}));
        status.did_fetch(&[id], Some(id), true);
        assert_eq!(status.status(), FetchStatus::Done);
        assert_eq!(status.last_event_id(), Some(id));
    }

    #[test]
    fn done_but_waiting_while_more_pages_follow() {
        let mut status = PushFetchStatus::default();
        let id = EventId::new();
        let (results, completion) = recorder();
        status.fetch(id, completion);

        status.did_fetch(&[id], Some(id), false);
        assert_eq!(status.status(), FetchStatus::Done);
        assert!(results.lock().unwrap().is_empty());

        status.did_fetch(&[], None, true);
        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Fetched]);
    }

    #[test]
    fn last_event_id_counts_as_fetched() {
        let mut status = PushFetchStatus::default();
        let id = EventId::new();
        let (results, completion) = recorder();
        status.fetch(id, completion);

        status.did_fetch(&[], Some(id), true);
        assert_eq!(status.status(), FetchStatus::Done);
        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Fetched]);
    }

    #[test]
    fn failure_marks_done_and_releases_waiters() {
        let mut status = PushFetchStatus::default();
        let (results, completion) = recorder();
        status.fetch(EventId::new(), completion);

        status.did_fail_to_fetch();
        assert_eq!(status.status(), FetchStatus::Done);
        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Failed]);
    }

    #[test]
    fn already_fetched_event_completes_immediately() {
        let id = EventId::new();
        let mut status = PushFetchStatus::new(Some(id));
        let (results, completion) = recorder();

        status.fetch(id, completion);
        assert_eq!(status.status(), FetchStatus::Done);
        assert_eq!(*results.lock().unwrap(), vec![PushFetchResult::Fetched]);
    }
}
