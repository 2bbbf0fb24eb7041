//! # sync-types
//!
//! Shared types for the courier client synchronization core.
//!
//! This crate provides the foundational types used across all courier-sync crates:
//! - [`EventId`], [`SequenceIndex`], [`SessionId`] - Identity and ordering types
//! - [`RawEvent`], [`StoredEvent`], [`DecodedEvent`] - The event pipeline's data model
//! - [`Request`], [`Response`], [`ResponseClass`] - Transport-neutral request/response shapes
//! - [`NotificationPage`] - Notification stream page payloads
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod ids;
mod page;
mod request;

pub use error::SyncError;
pub use event::{DecodedContent, DecodedEvent, EventOrigin, RawEvent, StoredEvent};
pub use ids::{EventId, SequenceIndex, SessionId};
pub use page::{NotificationEnvelope, NotificationPage};
pub use request::{Method, Request, Response, ResponseClass, STATUS_TRANSPORT_FAILURE};
