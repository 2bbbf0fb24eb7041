//! Mock session provider for testing.
//!
//! Returns ciphertext unchanged as plaintext unless told otherwise, and
//! records every call.

use super::{DecryptError, Decryption, SessionProvider};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use sync_types::SessionId;

/// Mock session provider.
///
/// Clones share state, so a test can keep a handle after moving one into
/// the decoder.
#[derive(Debug, Clone, Default)]
pub struct MockSessionProvider {
    inner: Arc<Mutex<MockSessionInner>>,
}

#[derive(Debug, Default)]
struct MockSessionInner {
    calls: Vec<(SessionId, Vec<u8>)>,
    outcomes: HashMap<Vec<u8>, DecryptError>,
    known_senders: HashSet<SessionId>,
    track_sessions: bool,
}

impl MockSessionProvider {
    /// Create a pass-through provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `created_new_session` the first time each sender is seen.
    pub fn with_session_tracking(self) -> Self {
        self.lock().track_sessions = true;
        self
    }

    /// Fail every decryption of `ciphertext` with `error`.
    pub fn fail_on(&self, ciphertext: &[u8], error: DecryptError) {
        self.lock().outcomes.insert(ciphertext.to_vec(), error);
    }

    /// Every `(sender, ciphertext)` passed to `decrypt`, in order.
    pub fn calls(&self) -> Vec<(SessionId, Vec<u8>)> {
        self.lock().calls.clone()
    }

    /// Number of `decrypt` calls.
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockSessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionProvider for MockSessionProvider {
    async fn decrypt(
        &mut self,
        sender: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Decryption, DecryptError> {
        let mut inner = self.lock();
        inner.calls.push((sender.clone(), ciphertext.to_vec()));

        if let Some(error) = inner.outcomes.get(ciphertext) {
            return Err(error.clone());
        }

        let created_new_session = inner.track_sessions && inner.known_senders.insert(sender.clone());
        Ok(Decryption {
            plaintext: ciphertext.to_vec(),
            created_new_session,
        })
    }
}
