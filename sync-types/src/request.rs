//! Transport-neutral request and response shapes.
//!
//! Request generators build [`Request`]s; the transport turns them into HTTP
//! calls and hands back a [`Response`]. Retry decisions are driven by
//! [`ResponseClass`], never by raw status codes.

use serde_json::Value;
use std::fmt;
use std::time::Instant;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// An outbound request produced by a request generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base, e.g. `/notifications`.
    pub path: String,
    /// Query parameters in insertion order.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub payload: Option<Value>,
    /// Deadline after which the request must not be sent anymore.
    pub expires_at: Option<Instant>,
}

impl Request {
    /// Create a request with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            payload: None,
            expires_at: None,
        }
    }

    /// Create a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Create a POST request with a JSON body.
    pub fn post(path: impl Into<String>, payload: Value) -> Self {
        Self::new(Method::Post, path).with_payload(payload)
    }

    /// Append a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set the JSON body.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the deadline after which the transport must not send the request.
    pub fn expire_at(mut self, deadline: Instant) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Look up the first value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Path plus query string, e.g. `/notifications?size=500&since=...`.
    ///
    /// Values are emitted verbatim; callers only put ids, integers and
    /// server-issued tokens in the query.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.path, query)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path_and_query())
    }
}

/// Outcome class of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    /// 2xx.
    Success,
    /// The request can never succeed as-is (4xx other than 408/420/429).
    PermanentError,
    /// Anything else, including network failure; retrying may succeed.
    TransientError,
    /// The request passed its deadline before it could be sent.
    Expired,
}

/// Status used for responses synthesized from transport failures.
pub const STATUS_TRANSPORT_FAILURE: u16 = 0;

/// A response routed back to the component that built the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status, or [`STATUS_TRANSPORT_FAILURE`].
    pub status: u16,
    /// Decoded JSON body, if any.
    pub payload: Option<Value>,
    expired: bool,
}

impl Response {
    /// Create a response with a status and optional payload.
    pub fn new(status: u16, payload: Option<Value>) -> Self {
        Self {
            status,
            payload,
            expired: false,
        }
    }

    /// A `200 OK` with a JSON body.
    pub fn ok(payload: Value) -> Self {
        Self::new(200, Some(payload))
    }

    /// A response carrying only a status code.
    pub fn status(status: u16) -> Self {
        Self::new(status, None)
    }

    /// A response standing in for a network or I/O failure.
    pub fn transport_failure() -> Self {
        Self::new(STATUS_TRANSPORT_FAILURE, None)
    }

    /// A response for a request that expired before being sent.
    pub fn expired() -> Self {
        Self {
            status: STATUS_TRANSPORT_FAILURE,
            payload: None,
            expired: true,
        }
    }

    /// Classify this response.
    pub fn result(&self) -> ResponseClass {
        if self.expired {
            return ResponseClass::Expired;
        }
        match self.status {
            200..=299 => ResponseClass::Success,
            408 | 420 | 429 => ResponseClass::TransientError,
            400..=499 => ResponseClass::PermanentError,
            _ => ResponseClass::TransientError,
        }
    }

    /// String value of the `label` field in an error payload.
    pub fn error_label(&self) -> Option<&str> {
        self.payload.as_ref()?.get("label")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn response_classification() {
        assert_eq!(Response::status(200).result(), ResponseClass::Success);
        assert_eq!(Response::status(201).result(), ResponseClass::Success);
        assert_eq!(Response::status(400).result(), ResponseClass::PermanentError);
        assert_eq!(Response::status(404).result(), ResponseClass::PermanentError);
        assert_eq!(Response::status(408).result(), ResponseClass::TransientError);
        assert_eq!(Response::status(429).result(), ResponseClass::TransientError);
        assert_eq!(Response::status(500).result(), ResponseClass::TransientError);
        assert_eq!(Response::status(503).result(), ResponseClass::TransientError);
        assert_eq!(
            Response::transport_failure().result(),
            ResponseClass::TransientError
        );
        assert_eq!(Response::expired().result(), ResponseClass::Expired);
    }

    #[test]
    fn path_and_query_keeps_insertion_order() {
        let request = Request::get("/notifications")
            .with_query("size", "500")
            .with_query("since", "abc");
        assert_eq!(request.path_and_query(), "/notifications?size=500&since=abc");
        assert_eq!(request.query_value("since"), Some("abc"));
        assert_eq!(request.query_value("client"), None);
        assert_eq!(request.to_string(), "GET /notifications?size=500&since=abc");
    }

    #[test]
    fn path_without_query() {
        assert_eq!(Request::get("/users/1").path_and_query(), "/users/1");
    }

    #[test]
    fn request_expiry() {
        let now = Instant::now();
        let request = Request::get("/x").expire_at(now + Duration::from_secs(5));
        assert!(!request.is_expired(now));
        assert!(request.is_expired(now + Duration::from_secs(5)));
        assert!(!Request::get("/y").is_expired(now));
    }

    #[test]
    fn error_label_reads_payload() {
        let response = Response::new(404, Some(json!({"label": "no-endpoint"})));
        assert_eq!(response.error_label(), Some("no-endpoint"));
        assert_eq!(Response::status(404).error_label(), None);
    }
}
