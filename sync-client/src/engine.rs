//! SyncEngine - the operation loop of courier-sync.
//!
//! # Architecture
//!
//! The engine owns the pure request sources (from sync-core) and performs
//! their I/O: it sends the requests they produce, routes the responses
//! back, appends fetched events to the event log and drains the log into
//! the application.
//!
//! ```text
//! RequestAggregator ──request──► Transport ──response──► source
//!                                                          │ StreamUpdate
//!                          consumer ◄── EventDecoder ◄── EventLog
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sync_client::{Config, SharedKeySessions, SyncEngine};
//!
//! let mut engine = SyncEngine::open(&config, transport, sessions, None).await?;
//! engine
//!     .run_until_idle(|batch| application.apply(batch))
//!     .await?;
//! engine.tear_down();
//! ```

use std::sync::{Arc, Mutex};
use sync_core::{OutboundRequest, PushFetchStatus, RequestAggregator, RequestSource, SourceId};
use sync_types::{DecodedEvent, EventId};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::decoder::{DecodeSummary, DecoderError, EventDecoder};
use crate::notifications::{update_channel, NotificationSync, StreamUpdate};
use crate::session::SessionProvider;
use crate::storage::{EventLog, SqliteEventLog, StorageError};
use crate::transport::{dispatch, Transport};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Decoding or delivering events failed.
    #[error("decoder error: {0}")]
    Decoder(#[from] DecoderError),

    /// The event log failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What [`SyncEngine::ingest_updates`] picked up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Events appended to the log.
    pub appended: usize,
    /// Potential gaps reported by the stream.
    pub gaps: usize,
    /// Failed stream fetches.
    pub failures: usize,
    /// The stream reported that it caught up.
    pub caught_up: bool,
}

/// Totals of one [`SyncEngine::run_until_idle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Requests sent.
    pub requests: usize,
    /// Events appended to the log.
    pub appended: usize,
    /// Events delivered to the consumer.
    pub delivered: usize,
    /// Potential gaps reported by the stream.
    pub gaps: usize,
    /// Failed stream fetches.
    pub failures: usize,
    /// The run stopped at `max_requests_per_run` with work left.
    pub hit_request_limit: bool,
}

/// Drives request sources, the event log and the decoder.
pub struct SyncEngine<L, S, T> {
    transport: T,
    aggregator: RequestAggregator,
    deferred: Option<OutboundRequest>,
    decoder: EventDecoder<L, S>,
    updates_tx: UnboundedSender<StreamUpdate>,
    updates_rx: UnboundedReceiver<StreamUpdate>,
    push_status: Option<Arc<Mutex<PushFetchStatus>>>,
    last_event_id: Option<EventId>,
    discard_pending: bool,
    max_requests_per_run: usize,
}

impl<S: SessionProvider, T: Transport> SyncEngine<SqliteEventLog, S, T> {
    /// Open the event log from `config` and set up notification syncing.
    ///
    /// Fetches triggered by push announcements take precedence over the
    /// notification stream.
    pub async fn open(
        config: &Config,
        transport: T,
        sessions: S,
        last_event_id: Option<EventId>,
    ) -> Result<Self, EngineError> {
        let log = SqliteEventLog::new(&config.event_log.database).await?;
        let decoder = EventDecoder::open(log, sessions, config.event_log.batch_size).await?;
        let mut engine = Self::new(transport, decoder, &config.scheduler);

        let status = Arc::new(Mutex::new(PushFetchStatus::new(last_event_id)));
        engine.add_source(Box::new(NotificationSync::push(
            &config.push,
            Arc::clone(&status),
            engine.update_sender(),
        )));
        engine.add_source(Box::new(NotificationSync::stream(
            &config.stream,
            last_event_id,
            engine.update_sender(),
        )));
        engine.push_status = Some(status);
        engine.last_event_id = last_event_id;

        info!(database = %config.event_log.database.display(), "Sync engine opened");
        Ok(engine)
    }
}

impl<L: EventLog, S: SessionProvider, T: Transport> SyncEngine<L, S, T> {
    /// Create an engine without request sources.
    pub fn new(transport: T, decoder: EventDecoder<L, S>, scheduler: &SchedulerConfig) -> Self {
        let (updates_tx, updates_rx) = update_channel();
        Self {
            transport,
            aggregator: RequestAggregator::new(),
            deferred: None,
            decoder,
            updates_tx,
            updates_rx,
            push_status: None,
            last_event_id: None,
            discard_pending: false,
            max_requests_per_run: scheduler.max_requests_per_run.max(1),
        }
    }

    /// Sender for sources that publish [`StreamUpdate`]s.
    pub fn update_sender(&self) -> UnboundedSender<StreamUpdate> {
        self.updates_tx.clone()
    }

    /// Add a request source below all existing ones.
    pub fn add_source(&mut self, source: Box<dyn RequestSource>) -> SourceId {
        self.aggregator.add_source(source)
    }

    /// Push fetch status created by [`open`](SyncEngine::open).
    ///
    /// Announce event ids from push notifications through it.
    pub fn push_status(&self) -> Option<Arc<Mutex<PushFetchStatus>>> {
        self.push_status.clone()
    }

    /// Id of the newest notification whose events are in the event log.
    ///
    /// Persist it and pass it to [`open`](SyncEngine::open) on the next
    /// start to resume the stream instead of fetching it from the start.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }

    /// The event decoder.
    pub fn decoder(&self) -> &EventDecoder<L, S> {
        &self.decoder
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Append every queued update's events to the log.
    pub async fn ingest_updates(&mut self) -> Result<IngestSummary, EngineError> {
        let mut summary = IngestSummary::default();
        while let Ok(update) = self.updates_rx.try_recv() {
            match update {
                StreamUpdate::Events {
                    events,
                    has_more,
                    cursor,
                } => {
                    let indices = self.decoder.store_events(&events).await?;
                    debug!(appended = indices.len(), has_more, "Stored fetched events");
                    summary.appended += indices.len();
                    if cursor.is_some() {
                        self.last_event_id = cursor;
                    }
                }
                StreamUpdate::Gap => summary.gaps += 1,
                StreamUpdate::Failed => summary.failures += 1,
                StreamUpdate::CaughtUp => {
                    summary.caught_up = true;
                    self.discard_pending = true;
                }
            }
        }
        Ok(summary)
    }

    /// Drain the event log into `consumer`.
    ///
    /// Once the stream has caught up and everything fetched up to that point
    /// was delivered, the seen-push set is discarded.
    pub async fn process_events<F, E>(&mut self, consumer: F) -> Result<DecodeSummary, EngineError>
    where
        F: FnMut(&[DecodedEvent]) -> Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let summary = self.decoder.process_stored_events(consumer).await?;
        if self.discard_pending {
            self.decoder.discard_seen_push_events().await?;
            self.discard_pending = false;
        }
        Ok(summary)
    }

    /// Send the next request of the highest-precedence source that has one.
    ///
    /// Returns `false` when no source had work.
    pub async fn send_next_request(&mut self) -> bool {
        let Some(outbound) = self.next_outbound() else {
            return false;
        };
        let response = dispatch(&self.transport, &outbound.request).await;
        self.aggregator.complete(outbound.route, &response);
        true
    }

    /// A request held back by the request limit goes out before any new one.
    fn next_outbound(&mut self) -> Option<OutboundRequest> {
        self.deferred.take().or_else(|| self.aggregator.next_request())
    }

    /// Send requests, store and deliver events until no source has work.
    ///
    /// Stops after `max_requests_per_run` requests. If a source still has a
    /// request at that point, it is kept for the next call and the summary
    /// reports `hit_request_limit`.
    pub async fn run_until_idle<F, E>(&mut self, mut consumer: F) -> Result<RunSummary, EngineError>
    where
        F: FnMut(&[DecodedEvent]) -> Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut summary = RunSummary::default();

        loop {
            let ingested = self.ingest_updates().await?;
            summary.appended += ingested.appended;
            summary.gaps += ingested.gaps;
            summary.failures += ingested.failures;

            let decoded = self.process_events(&mut consumer).await?;
            summary.delivered += decoded.delivered;

            if summary.requests >= self.max_requests_per_run {
                if let Some(outbound) = self.next_outbound() {
                    self.deferred = Some(outbound);
                    summary.hit_request_limit = true;
                    warn!(requests = summary.requests, "Request limit reached");
                }
                break;
            }
            if !self.send_next_request().await {
                break;
            }
            summary.requests += 1;
        }

        debug!(
            requests = summary.requests,
            appended = summary.appended,
            delivered = summary.delivered,
            "Sync run idle"
        );
        Ok(summary)
    }

    /// Tear down every request source. Required before drop.
    pub fn tear_down(&mut self) {
        self.deferred = None;
        self.aggregator.tear_down();
    }
}

impl<L, S, T> std::fmt::Debug for SyncEngine<L, S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("aggregator", &self.aggregator)
            .field("deferred", &self.deferred.is_some())
            .field("decoder", &self.decoder)
            .field("last_event_id", &self.last_event_id)
            .field("discard_pending", &self.discard_pending)
            .finish_non_exhaustive()
    }
}
