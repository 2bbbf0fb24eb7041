//! Push/stream deduplication.
//!
//! Events reach the client through two overlapping channels. Anything that
//! came in through the push channel is delivered right away and remembered;
//! when the notification stream later offers the same id it is dropped.
//!
//! The rule is applied per batch through [`BatchDedup`], which only
//! consults the committed [`SeenPushEvents`]. Ids delivered in the batch are
//! merged in once the batch has been acknowledged.

use std::collections::HashSet;
use sync_types::{EventId, EventOrigin};

/// Ids delivered through the push channel and not yet caught up on.
#[derive(Debug, Clone, Default)]
pub struct SeenPushEvents {
    ids: HashSet<EventId>,
}

impl SeenPushEvents {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` was delivered through the push channel.
    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remember ids delivered through the push channel.
    pub fn extend(&mut self, ids: impl IntoIterator<Item = EventId>) {
        self.ids.extend(ids);
    }

    /// Forget every id, once the stream has caught up.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Start deduplicating a batch against this set.
    pub fn batch(&self) -> BatchDedup<'_> {
        BatchDedup {
            seen: self,
            delivered_push_ids: Vec::new(),
            in_batch: HashSet::new(),
        }
    }
}

impl FromIterator<EventId> for SeenPushEvents {
    fn from_iter<T: IntoIterator<Item = EventId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Deduplication state of one batch.
#[derive(Debug)]
pub struct BatchDedup<'a> {
    seen: &'a SeenPushEvents,
    delivered_push_ids: Vec<EventId>,
    in_batch: HashSet<EventId>,
}

impl BatchDedup<'_> {
    /// Decide whether an event is delivered.
    ///
    /// Stream events whose id already came through the push channel, either
    /// in an earlier batch or earlier in this one, are dropped.
    pub fn admit(&mut self, id: EventId, origin: EventOrigin) -> bool {
        match origin {
            EventOrigin::PushChannel => {
                if self.in_batch.insert(id) {
                    self.delivered_push_ids.push(id);
                }
                true
            }
            EventOrigin::Stream => !(self.seen.contains(&id) || self.in_batch.contains(&id)),
        }
    }

    /// Push ids delivered in this batch, in delivery order and without
    /// repeats, to be recorded with the acknowledgment.
    pub fn into_push_ids(self) -> Vec<EventId> {
        self.delivered_push_ids
    }
}
