//! Event decoding and replay.
//!
//! The [`EventDecoder`] drains the event log batch by batch:
//!
//! 1. read the oldest unacknowledged events;
//! 2. drop stream events already delivered through the push channel;
//! 3. decrypt encrypted events;
//! 4. hand the ordered batch to the consumer;
//! 5. acknowledge the batch and record its push ids in one transaction.
//!
//! Nothing is acknowledged until the consumer returns `Ok`, so a crash or a
//! consumer error leaves the batch in the log to be replayed. After a
//! consumer error the decoder keeps the decoded batch and hands the same
//! events to the next call; a session provider is never asked to decrypt a
//! message twice within one decoder.

use crate::session::{DecryptError, SessionProvider};
use crate::storage::{EventLog, StorageError};
use sync_core::SeenPushEvents;
use sync_types::{DecodedContent, DecodedEvent, EventId, SequenceIndex, StoredEvent};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default number of events decoded per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Decoder errors.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// The event log failed; the batch was not acknowledged.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The consumer rejected a batch; it stays in the log.
    #[error("consumer failed: {0}")]
    Consumer(Box<dyn std::error::Error + Send + Sync>),
}

/// Totals of one [`EventDecoder::process_stored_events`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Batches acknowledged.
    pub batches: usize,
    /// Events handed to the consumer.
    pub delivered: usize,
    /// Stream events dropped as already delivered via push.
    pub duplicates: usize,
    /// Events dropped because the session reported them as replays.
    pub outdated: usize,
    /// Events delivered as undecryptable placeholders.
    pub undecryptable: usize,
}

/// Replays the event log into a consumer, exactly once.
pub struct EventDecoder<L, S> {
    log: L,
    sessions: S,
    seen: SeenPushEvents,
    batch_size: usize,
    unacknowledged: Option<DecodedBatch>,
}

/// A decoded batch the consumer has not accepted yet.
///
/// Decrypting advances session state, so a rejected batch is kept and
/// redelivered as is instead of being decrypted a second time.
struct DecodedBatch {
    up_to: SequenceIndex,
    push_ids: Vec<EventId>,
    events: Vec<DecodedEvent>,
    duplicates: usize,
    outdated: usize,
    undecryptable: usize,
}

impl<L: EventLog, S: SessionProvider> EventDecoder<L, S> {
    /// Create a decoder, loading the persisted seen-push set.
    pub async fn open(log: L, sessions: S, batch_size: usize) -> Result<Self, DecoderError> {
        let seen: SeenPushEvents = log.seen_push_events().await?.into_iter().collect();
        debug!(seen = seen.len(), batch_size, "Event decoder opened");
        Ok(Self {
            log,
            sessions,
            seen,
            batch_size: batch_size.max(1),
            unacknowledged: None,
        })
    }

    /// The underlying event log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// The session provider.
    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Ids currently suppressing stream duplicates.
    pub fn seen_push_events(&self) -> &SeenPushEvents {
        &self.seen
    }

    /// Append raw events to the log.
    pub async fn store_events(
        &self,
        events: &[sync_types::RawEvent],
    ) -> Result<Vec<SequenceIndex>, DecoderError> {
        Ok(self.log.append(events).await?)
    }

    /// Drain the log into `consumer`.
    ///
    /// The consumer is called once per non-empty batch, in index order. A
    /// batch whose events were all dropped is acknowledged without calling
    /// it.
    pub async fn process_stored_events<F, E>(
        &mut self,
        mut consumer: F,
    ) -> Result<DecodeSummary, DecoderError>
    where
        F: FnMut(&[DecodedEvent]) -> Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut summary = DecodeSummary::default();

        loop {
            let batch = match self.unacknowledged.take() {
                Some(batch) => {
                    debug!(up_to = %batch.up_to, "Redelivering unacknowledged batch");
                    batch
                }
                None => {
                    let stored = self.log.next_batch(self.batch_size).await?;
                    match self.decode_batch(stored).await {
                        Some(batch) => batch,
                        None => break,
                    }
                }
            };

            if !batch.events.is_empty() {
                if let Err(e) = consumer(&batch.events) {
                    self.unacknowledged = Some(batch);
                    return Err(DecoderError::Consumer(e.into()));
                }
            }

            if let Err(e) = self.log.commit_batch(batch.up_to, &batch.push_ids).await {
                self.unacknowledged = Some(batch);
                return Err(e.into());
            }

            summary.batches += 1;
            summary.delivered += batch.events.len();
            summary.duplicates += batch.duplicates;
            summary.outdated += batch.outdated;
            summary.undecryptable += batch.undecryptable;
            debug!(up_to = %batch.up_to, delivered = batch.events.len(), "Batch processed");
            self.seen.extend(batch.push_ids);
        }

        if summary.batches > 0 {
            info!(
                batches = summary.batches,
                delivered = summary.delivered,
                duplicates = summary.duplicates,
                undecryptable = summary.undecryptable,
                "Event log drained"
            );
        }
        Ok(summary)
    }

    /// Deduplicate and decrypt one batch read from the log.
    async fn decode_batch(&mut self, stored: Vec<StoredEvent>) -> Option<DecodedBatch> {
        let up_to = stored.last()?.index;
        let mut batch = DecodedBatch {
            up_to,
            push_ids: Vec::new(),
            events: Vec::with_capacity(stored.len()),
            duplicates: 0,
            outdated: 0,
            undecryptable: 0,
        };

        let mut dedup = self.seen.batch();
        let mut admitted = Vec::with_capacity(stored.len());
        for event in stored {
            if dedup.admit(event.event.id, event.event.origin) {
                admitted.push(event);
            } else {
                debug!(event_id = %event.event.id, index = %event.index, "Dropped stream duplicate of push event");
                batch.duplicates += 1;
            }
        }
        batch.push_ids = dedup.into_push_ids();

        for event in admitted {
            match decode(&mut self.sessions, event).await {
                Decoded::Event(event) => {
                    if event.is_undecryptable() {
                        batch.undecryptable += 1;
                    }
                    batch.events.push(event);
                }
                Decoded::Outdated => batch.outdated += 1,
            }
        }
        Some(batch)
    }

    /// Forget every push id, in memory and on disk.
    ///
    /// Called once the notification stream has caught up: no stream event
    /// can duplicate an earlier push any more.
    pub async fn discard_seen_push_events(&mut self) -> Result<(), DecoderError> {
        self.log.clear_seen_push_events().await?;
        let discarded = self.seen.len();
        self.seen.clear();
        debug!(discarded, "Seen push events discarded");
        Ok(())
    }
}

impl<L, S> std::fmt::Debug for EventDecoder<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDecoder")
            .field("seen", &self.seen.len())
            .field("batch_size", &self.batch_size)
            .field("unacknowledged", &self.unacknowledged.is_some())
            .finish_non_exhaustive()
    }
}

enum Decoded {
    Event(DecodedEvent),
    Outdated,
}

async fn decode<S: SessionProvider>(sessions: &mut S, stored: StoredEvent) -> Decoded {
    let StoredEvent { index, event } = stored;

    let (content, session_was_created) = if !event.is_encrypted {
        (DecodedContent::Plaintext(event.payload), false)
    } else {
        match &event.sender {
            None => {
                warn!(event_id = %event.id, %index, "Encrypted event without sender");
                (
                    DecodedContent::Undecryptable {
                        reason: "missing sender".into(),
                    },
                    false,
                )
            }
            Some(sender) => match sessions.decrypt(sender, &event.payload).await {
                Ok(decryption) => (
                    DecodedContent::Plaintext(decryption.plaintext),
                    decryption.created_new_session,
                ),
                Err(DecryptError::DuplicateOrOutdated) => {
                    debug!(event_id = %event.id, %index, %sender, "Dropped duplicate or outdated message");
                    return Decoded::Outdated;
                }
                Err(DecryptError::Failed(reason)) => {
                    warn!(event_id = %event.id, %index, %sender, %reason, "Undecryptable event");
                    (DecodedContent::Undecryptable { reason }, false)
                }
            },
        }
    };

    Decoded::Event(DecodedEvent {
        id: event.id,
        index,
        envelope_type: event.envelope_type,
        origin: event.origin,
        sender: event.sender,
        content,
        session_was_created,
    })
}
