//! Identifier-keyed request scheduling.
//!
//! [`IdentifierSync`] fetches or pushes entities by identifier. Callers add
//! identifiers with [`sync`](IdentifierSync::sync); every call to
//! [`next_request`](IdentifierSync::next_request) takes up to
//! `fetch_limit` of them and asks the [`IdentifierTranscoder`] for a
//! request covering exactly that subset.
//!
//! ```text
//! Idle ──sync──► Pending ──next_request──► InFlight ──success/permanent──► Idle
//!                   ▲                          │
//!                   └────── transient ─────────┘
//! ```
//!
//! An identifier is referenced by at most one outstanding request.

use std::collections::BTreeSet;
use std::fmt::Debug;
use sync_types::{Response, ResponseClass};
use tracing::{debug, warn};

use crate::aggregator::RequestSource;
use crate::queue::{RequestTicket, ScheduledRequest, SyncQueue};

/// Completion signals emitted by an identifier scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// Nothing is pending or in flight anymore.
    FinishedSyncingAllObjects,
    /// A request failed permanently.
    FailedToSyncAllObjects,
}

/// Builds requests for, and consumes responses about, a set of identifiers.
pub trait IdentifierTranscoder<I> {
    /// Maximum number of identifiers covered by a single request.
    fn fetch_limit(&self) -> usize;

    /// Whether requests may be built right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Build one request covering exactly `identifiers`.
    ///
    /// Returning `None` leaves the identifiers pending.
    fn request_for(&mut self, identifiers: &BTreeSet<I>) -> Option<sync_types::Request>;

    /// Called for success and permanent-error responses.
    fn did_receive(&mut self, response: &Response, identifiers: &BTreeSet<I>);

    /// Receives [`SyncSignal`]s when the scheduler is driven through a
    /// [`RequestAggregator`](crate::RequestAggregator).
    fn on_sync_signal(&mut self, _signal: SyncSignal) {}
}

/// Scheduler for identifier-keyed synchronization.
#[derive(Debug)]
pub struct IdentifierSync<I: Ord + Clone, T> {
    queue: SyncQueue<I>,
    transcoder: T,
}

impl<I, T> IdentifierSync<I, T>
where
    I: Ord + Clone + Debug,
    T: IdentifierTranscoder<I>,
{
    /// Create a scheduler driving the given transcoder.
    pub fn new(transcoder: T) -> Self {
        Self {
            queue: SyncQueue::new(),
            transcoder,
        }
    }

    /// The transcoder.
    pub fn transcoder(&self) -> &T {
        &self.transcoder
    }

    /// Mutable access to the transcoder.
    pub fn transcoder_mut(&mut self) -> &mut T {
        &mut self.transcoder
    }

    /// Whether any identifier is pending or in flight.
    pub fn is_syncing(&self) -> bool {
        self.queue.is_syncing()
    }

    /// Whether a request for `id` is outstanding.
    pub fn is_in_flight(&self, id: &I) -> bool {
        self.queue.is_in_flight(id)
    }

    /// Whether `id` is waiting for a request.
    pub fn is_pending(&self, id: &I) -> bool {
        self.queue.is_pending(id)
    }

    /// Number of pending identifiers.
    pub fn pending_count(&self) -> usize {
        self.queue.pending_len()
    }

    /// Number of identifiers in flight.
    pub fn in_flight_count(&self) -> usize {
        self.queue.in_flight_len()
    }

    /// Add identifiers that should be synchronized.
    ///
    /// Identifiers already in flight are not added again. Calling this with
    /// no identifiers while idle reports
    /// [`SyncSignal::FinishedSyncingAllObjects`] right away.
    pub fn sync(&mut self, identifiers: impl IntoIterator<Item = I>) -> Option<SyncSignal> {
        let identifiers: Vec<I> = identifiers.into_iter().collect();
        if identifiers.is_empty() && !self.queue.is_syncing() {
            return Some(SyncSignal::FinishedSyncingAllObjects);
        }
        let added = self.queue.enqueue(identifiers);
        debug!(added, pending = self.queue.pending_len(), "Identifiers queued");
        None
    }

    /// Remove identifiers from the pending set.
    ///
    /// Identifiers already in flight are not affected.
    pub fn cancel<'a>(&mut self, identifiers: impl IntoIterator<Item = &'a I>)
    where
        I: 'a,
    {
        self.queue.cancel(identifiers);
    }

    /// Build the next request, if anything is pending.
    pub fn next_request(&mut self) -> Option<ScheduledRequest> {
        if self.queue.pending_len() == 0 || !self.transcoder.is_available() {
            return None;
        }
        let limit = self.transcoder.fetch_limit().max(1);
        let scheduled = self.queue.select(limit, |_| true);
        let request = self.transcoder.request_for(&scheduled)?;
        debug!(count = scheduled.len(), %request, "Scheduling identifiers");
        let ticket = self.queue.dispatch(scheduled);
        Some(ScheduledRequest { ticket, request })
    }

    /// Route a response to the request identified by `ticket`.
    ///
    /// Success and permanent errors settle the identifiers and reach the
    /// transcoder; anything else puts them back into the pending set.
    pub fn handle_response(
        &mut self,
        ticket: RequestTicket,
        response: &Response,
    ) -> Vec<SyncSignal> {
        let Some(scheduled) = self.queue.ack(ticket) else {
            debug!(ticket = ticket.value(), "Response for unknown ticket ignored");
            return Vec::new();
        };

        let mut signals = Vec::new();
        match response.result() {
            ResponseClass::Success => {
                self.transcoder.did_receive(response, &scheduled);
            }
            ResponseClass::PermanentError => {
                warn!(
                    status = response.status,
                    identifiers = ?scheduled,
                    "Permanent error while syncing identifiers"
                );
                self.transcoder.did_receive(response, &scheduled);
                signals.push(SyncSignal::FailedToSyncAllObjects);
            }
            ResponseClass::TransientError | ResponseClass::Expired => {
                debug!(
                    status = response.status,
                    count = scheduled.len(),
                    "Requeueing identifiers after transient failure"
                );
                self.queue.requeue(scheduled);
            }
        }

        if !self.queue.is_syncing() {
            signals.push(SyncSignal::FinishedSyncingAllObjects);
        }
        signals
    }
}

impl<I, T> RequestSource for IdentifierSync<I, T>
where
    I: Ord + Clone + Debug + Send,
    T: IdentifierTranscoder<I> + Send,
{
    fn next_request(&mut self) -> Option<ScheduledRequest> {
        IdentifierSync::next_request(self)
    }

    fn handle_response(&mut self, ticket: RequestTicket, response: &Response) {
        for signal in IdentifierSync::handle_response(self, ticket, response) {
            self.transcoder.on_sync_signal(signal);
        }
    }
}
