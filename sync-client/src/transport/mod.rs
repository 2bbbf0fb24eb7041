//! Transport abstraction for courier-sync.
//!
//! A [`Transport`] sends one [`Request`] and returns the backend's
//! [`Response`]. Errors below HTTP (connection refused, timeouts) are
//! reported as [`TransportError`]; [`dispatch`] folds them into a transient
//! [`Response`] so the request sources can treat every outcome uniformly.
//!
//! # Example
//!
//! ```
//! use sync_client::transport::{dispatch, MockTransport};
//! use sync_types::{Request, Response, ResponseClass};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let transport = MockTransport::new();
//! transport.queue_response(Response::status(204));
//!
//! let response = dispatch(&transport, &Request::get("/self")).await;
//! assert_eq!(response.result(), ResponseClass::Success);
//! # }
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use std::time::Instant;
use sync_types::{Request, Response};
use thiserror::Error;
use tracing::{debug, warn};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The response body could not be read.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Request timeout.
    #[error("request timeout")]
    Timeout,
}

/// Sends requests to the backend.
///
/// Implementations handle the underlying connection mechanism (HTTPS,
/// mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and wait for the response.
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        (**self).send(request).await
    }
}

/// Send `request`, turning every failure into a [`Response`].
///
/// A request past its deadline is not sent and yields [`Response::expired`];
/// a transport error yields [`Response::transport_failure`].
pub async fn dispatch<T: Transport + ?Sized>(transport: &T, request: &Request) -> Response {
    if request.is_expired(Instant::now()) {
        debug!(%request, "Request expired before sending");
        return Response::expired();
    }

    match transport.send(request).await {
        Ok(response) => {
            debug!(%request, status = response.status, "Response received");
            response
        }
        Err(e) => {
            warn!(%request, error = %e, "Transport failure");
            Response::transport_failure()
        }
    }
}
