//! # sync-client
//!
//! Client side of courier-sync: the I/O half that the pure state machines
//! in sync-core are driven by.
//!
//! ## Features
//!
//! - **Durable event log**: SQLite (WAL), crash-safe, ordered
//! - **Exactly-once replay**: push/stream deduplication before decryption,
//!   acknowledgment only after the consumer accepted a batch
//! - **Pluggable sessions**: [`SessionProvider`] trait, with a shared-key
//!   XChaCha20-Poly1305 implementation and a mock
//! - **Transport abstraction**: [`Transport`] trait, with a mock
//! - **Notification stream sync**: paged catch-up and push-triggered fetches
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{Config, SharedKeySessions, SyncEngine};
//!
//! let config = Config::from_file("courier.toml".as_ref())?;
//! let sessions = SharedKeySessions::new(root_secret);
//! let mut engine = SyncEngine::open(&config, transport, sessions, last_event_id).await?;
//!
//! let summary = engine.run_until_idle(|batch| store.apply(batch)).await?;
//! engine.tear_down();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod decoder;
pub mod engine;
pub mod notifications;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::{Config, ConfigError, EventLogConfig, SchedulerConfig, StreamConfig};
pub use decoder::{DecodeSummary, DecoderError, EventDecoder, DEFAULT_BATCH_SIZE};
pub use engine::{EngineError, IngestSummary, RunSummary, SyncEngine};
pub use notifications::{
    update_channel, NotificationBatch, NotificationPageDecoder, NotificationSync, StreamUpdate,
};
pub use session::{
    CryptoError, DecryptError, Decryption, MockSessionProvider, SessionProvider,
    SharedKeySessions,
};
pub use storage::{EventLog, SqliteEventLog, StorageError};
pub use transport::{dispatch, MockTransport, Transport, TransportError};
