//! Mock transport for testing.
//!
//! Allows queueing responses and capturing sent requests for verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::{Request, Response};

/// Mock transport for testing.
///
/// Responses queued for a specific path are used first; otherwise the
/// global queue is consulted. With nothing queued, `send` fails as if the
/// connection had been closed.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    sent_requests: Vec<Request>,
    response_queue: VecDeque<Response>,
    path_queues: HashMap<String, VecDeque<Response>>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next request to any path.
    pub fn queue_response(&self, response: Response) {
        self.lock().response_queue.push_back(response);
    }

    /// Queue a response for the next request to `path`.
    pub fn queue_response_for(&self, path: &str, response: Response) {
        self.lock()
            .path_queues
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Get all requests that were sent.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.lock().sent_requests.clone()
    }

    /// Get the last request that was sent.
    pub fn last_sent(&self) -> Option<Request> {
        self.lock().sent_requests.last().cloned()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Clear all state (requests and queues).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_requests.push(request.clone());

        let for_path = inner
            .path_queues
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        for_path
            .or_else(|| inner.response_queue.pop_front())
            .ok_or_else(|| TransportError::ConnectionFailed("no response queued".into()))
    }
}
