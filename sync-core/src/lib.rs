//! # sync-core
//!
//! Pure scheduling logic for courier-sync (no I/O, instant tests).
//!
//! This crate implements the request generators and bookkeeping that decide
//! *what* to send and *when*, without any network or disk I/O:
//!
//! - [`SyncQueue`] - pending / in-flight bookkeeping shared by the schedulers
//! - [`IdentifierSync`] - fetch or push entities by identifier, bounded per request
//! - [`DependencySync`] - hold entities back until their dependencies resolve
//! - [`Paginator`] - cursor-based listing, one page request at a time
//! - [`SeenPushEvents`] - push/stream deduplication set
//! - [`PushFetchStatus`] - tracks events announced by push notifications
//! - [`RequestAggregator`] - fixed-precedence composition of request sources
//!
//! ## Design Philosophy
//!
//! Every type here is driven by plain method calls that take `&mut self`.
//! Exclusive ownership is the serial execution context: no locks, no
//! callbacks into the network, and responses are routed back explicitly by
//! [`RequestTicket`]. The actual I/O (transport, event log, decryption) is
//! performed by `sync-client`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod dedup;
pub mod dependency;
pub mod dependency_sync;
pub mod identifier_sync;
pub mod paginator;
pub mod push_status;
pub mod queue;

pub use aggregator::{OutboundRequest, RequestAggregator, RequestRoute, RequestSource, SourceId};
pub use dedup::{BatchDedup, SeenPushEvents};
pub use dependency::DependentObjects;
pub use dependency_sync::{
    CompletionHandler, DependencySync, EntityCompletion, EntitySyncOutcome, EntityTranscoder,
};
pub use identifier_sync::{IdentifierSync, IdentifierTranscoder, SyncSignal};
pub use paginator::{
    DecodedPage, PageDecoder, PageError, PaginationCursor, Paginator, PaginatorStatus,
};
pub use push_status::{FetchCompletion, FetchStatus, PushFetchResult, PushFetchStatus};
pub use queue::{RequestTicket, ScheduledRequest, SyncQueue};
