//! Shared-key sessions.
//!
//! Each sender gets its own XChaCha20-Poly1305 key, derived from a root
//! secret via HKDF-SHA256 with the sender's session id as `info`.
//!
//! Wire format of a message:
//!
//! ```text
//! nonce (24 bytes) || counter (8 bytes, big-endian) || ciphertext + tag
//! ```
//!
//! The counter is authenticated as associated data. A message whose counter
//! is not greater than the highest one seen from that sender is a replay and
//! reported as [`DecryptError::DuplicateOrOutdated`].
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - The root secret and derived keys are zeroed on drop

use super::{DecryptError, Decryption, SessionProvider};
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use sync_types::SessionId;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const COUNTER_SIZE: usize = 8;
const HEADER_SIZE: usize = NONCE_SIZE + COUNTER_SIZE;
const SESSION_SALT: &[u8] = b"courier-sync-session-v1";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Message shorter than its header.
    #[error("message too short: {0} bytes")]
    Truncated(usize),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Random number generation failed.
    #[error("random number generation failed: {0}")]
    Random(String),
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; KEY_SIZE]);

struct Session {
    key: SessionKey,
    highest_counter: Option<u64>,
}

/// A [`SessionProvider`] backed by a root secret shared with every sender.
pub struct SharedKeySessions {
    root: SessionKey,
    sessions: HashMap<SessionId, Session>,
}

impl SharedKeySessions {
    /// Create a provider from a root secret.
    pub fn new(root_secret: [u8; KEY_SIZE]) -> Self {
        Self {
            root: SessionKey(root_secret),
            sessions: HashMap::new(),
        }
    }

    /// Create a provider with a random root secret (for testing).
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
        let sessions = Self::new(bytes);
        bytes.zeroize();
        Ok(sessions)
    }

    /// Number of senders a session exists for.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Encrypt `plaintext` as `sender` would, with the given counter.
    pub fn seal(
        &self,
        sender: &SessionId,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.derive(sender)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
        let counter_bytes = counter.to_be_bytes();

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &counter_bytes,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut message = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        message.extend_from_slice(&nonce_bytes);
        message.extend_from_slice(&counter_bytes);
        message.extend_from_slice(&ciphertext);
        Ok(message)
    }

    fn derive(&self, sender: &SessionId) -> Result<SessionKey, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(SESSION_SALT), &self.root.0);
        let mut key = SessionKey([0u8; KEY_SIZE]);
        hkdf.expand(sender.as_str().as_bytes(), &mut key.0)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(key)
    }

    fn open(key: &SessionKey, message: &[u8]) -> Result<(u64, Vec<u8>), CryptoError> {
        if message.len() < HEADER_SIZE {
            return Err(CryptoError::Truncated(message.len()));
        }
        let (nonce, rest) = message.split_at(NONCE_SIZE);
        let (counter_bytes, ciphertext) = rest.split_at(COUNTER_SIZE);

        let mut counter = [0u8; COUNTER_SIZE];
        counter.copy_from_slice(counter_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: counter_bytes,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok((u64::from_be_bytes(counter), plaintext))
    }
}

#[async_trait]
impl SessionProvider for SharedKeySessions {
    async fn decrypt(
        &mut self,
        sender: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Decryption, DecryptError> {
        let (counter, plaintext, created_new_session) = match self.sessions.get(sender) {
            Some(session) => {
                let (counter, plaintext) = Self::open(&session.key, ciphertext)
                    .map_err(|e| DecryptError::Failed(e.to_string()))?;
                if session.highest_counter.is_some_and(|highest| counter <= highest) {
                    return Err(DecryptError::DuplicateOrOutdated);
                }
                (counter, plaintext, false)
            }
            None => {
                let key = self
                    .derive(sender)
                    .map_err(|e| DecryptError::Failed(e.to_string()))?;
                let (counter, plaintext) = Self::open(&key, ciphertext)
                    .map_err(|e| DecryptError::Failed(e.to_string()))?;
                self.sessions.insert(
                    sender.clone(),
                    Session {
                        key,
                        highest_counter: None,
                    },
                );
                debug!(%sender, "Session created");
                (counter, plaintext, true)
            }
        };

        if let Some(session) = self.sessions.get_mut(sender) {
            session.highest_counter = Some(counter);
        }

        Ok(Decryption {
            plaintext,
            created_new_session,
        })
    }
}

// Don't leak secrets in debug output
impl std::fmt::Debug for SharedKeySessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeySessions")
            .field("root", &"[REDACTED]")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
