//! Session decryption for encrypted events.
//!
//! The decoder hands every encrypted payload to a [`SessionProvider`]. The
//! provider owns the per-sender cryptographic sessions; how they were
//! established is outside this crate.
//!
//! Outcomes:
//!
//! - [`Decryption`] with the plaintext, flagging whether a session with the
//!   sender was created by this message.
//! - [`DecryptError::DuplicateOrOutdated`]: the message was already
//!   decrypted once. The event is dropped.
//! - [`DecryptError::Failed`]: anything else. The event is delivered as an
//!   undecryptable placeholder.

mod mock;
mod shared_key;

pub use mock::MockSessionProvider;
pub use shared_key::{CryptoError, SharedKeySessions, KEY_SIZE, NONCE_SIZE};

use async_trait::async_trait;
use sync_types::SessionId;
use thiserror::Error;

/// A successful decryption.
#[derive(Clone, PartialEq, Eq)]
pub struct Decryption {
    /// The decrypted payload.
    pub plaintext: Vec<u8>,
    /// Whether this message established a new session with the sender.
    pub created_new_session: bool,
}

impl std::fmt::Debug for Decryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryption")
            .field(
                "plaintext",
                &format!("[{} bytes REDACTED]", self.plaintext.len()),
            )
            .field("created_new_session", &self.created_new_session)
            .finish()
    }
}

/// Why a payload could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// The message was already decrypted, or is older than the session state.
    #[error("duplicate or outdated message")]
    DuplicateOrOutdated,

    /// Decryption failed for any other reason.
    #[error("decryption failed: {0}")]
    Failed(String),
}

/// Decrypts payloads from remote senders.
///
/// Only the decoder calls this, one event at a time.
#[async_trait]
pub trait SessionProvider: Send {
    /// Decrypt `ciphertext` received from `sender`.
    async fn decrypt(
        &mut self,
        sender: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Decryption, DecryptError>;
}

#[async_trait]
impl<S: SessionProvider + ?Sized> SessionProvider for Box<S> {
    async fn decrypt(
        &mut self,
        sender: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Decryption, DecryptError> {
        (**self).decrypt(sender, ciphertext).await
    }
}
