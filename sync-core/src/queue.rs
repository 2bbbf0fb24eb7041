//! Pending / in-flight bookkeeping for request schedulers.
//!
//! This module provides the queue shared by [`IdentifierSync`] and
//! [`DependencySync`]:
//! - Pending tracking (identifiers waiting for a request slot)
//! - In-flight tracking keyed by [`RequestTicket`]
//! - Requeueing after transient failures
//!
//! Identifiers flow through the queue in this order:
//! 1. `enqueue()` - add to pending (ignored while already in flight)
//! 2. `dispatch()` - move a selection to in-flight under a fresh ticket
//! 3. `ack()` - the ticket's response arrived, drop the identifiers
//!
//! If the request must be retried, call `requeue()` with the acked set.
//!
//! [`IdentifierSync`]: crate::IdentifierSync
//! [`DependencySync`]: crate::DependencySync

use std::collections::{BTreeMap, BTreeSet};
use sync_types::Request;

/// Routes a response back to the request it answers.
///
/// Tickets are unique per scheduler instance and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTicket(u64);

impl RequestTicket {
    /// Create a ticket with an explicit value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Numeric value of the ticket.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A request handed out by a scheduler, tagged with its ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRequest {
    /// Pass this back together with the response.
    pub ticket: RequestTicket,
    /// The request to send.
    pub request: Request,
}

/// Pending and in-flight identifiers of a single scheduler.
///
/// An identifier is never pending and in flight at the same time.
#[derive(Debug, Clone)]
pub struct SyncQueue<I: Ord + Clone> {
    pending: BTreeSet<I>,
    in_flight: BTreeMap<RequestTicket, BTreeSet<I>>,
    in_flight_ids: BTreeSet<I>,
    next_ticket: u64,
}

impl<I: Ord + Clone> SyncQueue<I> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            in_flight_ids: BTreeSet::new(),
            next_ticket: 1,
        }
    }

    /// Add identifiers to the pending set.
    ///
    /// Identifiers currently in flight are skipped. Returns the number of
    /// identifiers that were newly added.
    pub fn enqueue(&mut self, ids: impl IntoIterator<Item = I>) -> usize {
        let mut added = 0;
        for id in ids {
            if self.in_flight_ids.contains(&id) {
                continue;
            }
            if self.pending.insert(id) {
                added += 1;
            }
        }
        added
    }

    /// Remove identifiers from the pending set. In-flight ones are untouched.
    pub fn cancel<'a>(&mut self, ids: impl IntoIterator<Item = &'a I>)
    where
        I: 'a,
    {
        for id in ids {
            self.pending.remove(id);
        }
    }

    /// Pick up to `limit` pending identifiers accepted by `filter`, in order.
    ///
    /// The selection stays pending until passed to [`dispatch`](Self::dispatch).
    pub fn select(&self, limit: usize, mut filter: impl FnMut(&I) -> bool) -> BTreeSet<I> {
        self.pending
            .iter()
            .filter(|id| filter(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Move a selection from pending to in flight under a new ticket.
    pub fn dispatch(&mut self, ids: BTreeSet<I>) -> RequestTicket {
        let ticket = RequestTicket(self.next_ticket);
        self.next_ticket += 1;
        for id in &ids {
            self.pending.remove(id);
            self.in_flight_ids.insert(id.clone());
        }
        self.in_flight.insert(ticket, ids);
        ticket
    }

    /// Settle a ticket, returning the identifiers it carried.
    ///
    /// Returns `None` for unknown or already settled tickets.
    pub fn ack(&mut self, ticket: RequestTicket) -> Option<BTreeSet<I>> {
        let ids = self.in_flight.remove(&ticket)?;
        for id in &ids {
            self.in_flight_ids.remove(id);
        }
        Some(ids)
    }

    /// Put settled identifiers back into the pending set.
    pub fn requeue(&mut self, ids: BTreeSet<I>) {
        self.pending.extend(ids);
    }

    /// Drop an identifier from pending, keeping it if in flight.
    pub fn remove_pending(&mut self, id: &I) -> bool {
        self.pending.remove(id)
    }

    /// Whether the identifier is waiting for a request slot.
    pub fn is_pending(&self, id: &I) -> bool {
        self.pending.contains(id)
    }

    /// Whether a request carrying the identifier is outstanding.
    pub fn is_in_flight(&self, id: &I) -> bool {
        self.in_flight_ids.contains(id)
    }

    /// True while anything is pending or in flight.
    pub fn is_syncing(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Number of pending identifiers.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of identifiers in flight.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight_ids.len()
    }

    /// Number of outstanding tickets.
    pub fn outstanding_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Iterate the pending identifiers in order.
    pub fn pending(&self) -> impl Iterator<Item = &I> {
        self.pending.iter()
    }

    /// Forget everything, including outstanding tickets.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        self.in_flight_ids.clear();
    }
}

impl<I: Ord + Clone> Default for SyncQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}
