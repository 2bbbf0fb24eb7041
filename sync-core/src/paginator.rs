//! Cursor-based paginated listing.
//!
//! The [`Paginator`] issues `GET <base_path>?size=<page_size>` requests,
//! adding `<start_key>=<token>` once a continuation token is known. Only one
//! page request is outstanding at a time.
//!
//! ```text
//! Idle ──start──► InProgress ──last page / permanent error──► Done
//!                  │    ▲
//!                  └────┘ page with more / transient error
//! ```
//!
//! Page bodies are interpreted by a [`PageDecoder`], which also yields the
//! continuation token for the next page.

use sync_types::{Request, Response, ResponseClass};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue::{RequestTicket, ScheduledRequest};

/// Lifecycle of a [`Paginator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatorStatus {
    /// Not started.
    Idle,
    /// Pages remain to be fetched.
    InProgress,
    /// The last page arrived or a permanent error occurred.
    Done,
}

/// Position within the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    /// Continuation token for the next page; `None` for the first page.
    pub token: Option<String>,
    /// Requested page size.
    pub page_size: usize,
    /// Whether the previous page announced more results.
    pub has_more: bool,
}

/// A decoded page with its continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPage<P> {
    /// The page content.
    pub page: P,
    /// Whether further pages exist.
    pub has_more: bool,
    /// Token to continue from, if the page provided one.
    pub next_token: Option<String>,
}

/// Errors reported for a page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// The backend rejected the listing request.
    #[error("listing rejected with status {status}")]
    Permanent {
        /// HTTP status.
        status: u16,
    },

    /// The page body could not be interpreted.
    #[error("malformed page: {0}")]
    Malformed(String),
}

/// Interprets listing responses.
pub trait PageDecoder {
    /// Decoded page type.
    type Page;

    /// Decode a response body into a page.
    fn decode(&mut self, response: &Response) -> Result<DecodedPage<Self::Page>, PageError>;

    /// Whether a permanent-error response still carries a page to decode.
    fn should_parse_error(&mut self, _response: &Response) -> bool {
        false
    }
}

/// Fetches a listing page by page.
#[derive(Debug)]
pub struct Paginator<P> {
    base_path: String,
    start_key: String,
    page_size: usize,
    extra_query: Vec<(String, String)>,
    status: PaginatorStatus,
    cursor: Option<PaginationCursor>,
    last_token: Option<String>,
    outstanding: Option<RequestTicket>,
    next_ticket: u64,
    decoder: P,
}

impl<P: PageDecoder> Paginator<P> {
    /// Create an idle paginator.
    pub fn new(
        base_path: impl Into<String>,
        start_key: impl Into<String>,
        page_size: usize,
        decoder: P,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            start_key: start_key.into(),
            page_size,
            extra_query: Vec::new(),
            status: PaginatorStatus::Idle,
            cursor: None,
            last_token: None,
            outstanding: None,
            next_ticket: 1,
            decoder,
        }
    }

    /// Add a query parameter sent with every page request.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query.push((key.into(), value.into()));
        self
    }

    /// Remember a token to resume from on the next start.
    pub fn with_start_token(mut self, token: Option<String>) -> Self {
        self.last_token = token;
        self
    }

    /// The page decoder.
    pub fn decoder(&self) -> &P {
        &self.decoder
    }

    /// Mutable access to the page decoder.
    pub fn decoder_mut(&mut self) -> &mut P {
        &mut self.decoder
    }

    /// Current status.
    pub fn status(&self) -> PaginatorStatus {
        self.status
    }

    /// Current cursor, if a fetch is running.
    pub fn cursor(&self) -> Option<&PaginationCursor> {
        self.cursor.as_ref()
    }

    /// Most recent continuation token, kept across fetches.
    pub fn last_token(&self) -> Option<&str> {
        self.last_token.as_deref()
    }

    /// Whether a page request is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Whether the fetch is running and pages remain.
    pub fn has_more_to_fetch(&self) -> bool {
        self.status == PaginatorStatus::InProgress
    }

    /// Start fetching from the very first page.
    pub fn start(&mut self) {
        self.begin(None);
    }

    /// Restart from the most recent continuation token.
    pub fn reset_fetching(&mut self) {
        self.begin(self.last_token.clone());
    }

    fn begin(&mut self, token: Option<String>) {
        debug!(base_path = %self.base_path, ?token, "Starting listing");
        self.cursor = Some(PaginationCursor {
            token,
            page_size: self.page_size,
            has_more: true,
        });
        self.status = PaginatorStatus::InProgress;
        self.outstanding = None;
    }

    /// Build the request for the current cursor.
    ///
    /// Returns `None` unless in progress with no request outstanding.
    pub fn next_request(&mut self) -> Option<ScheduledRequest> {
        if self.status != PaginatorStatus::InProgress || self.outstanding.is_some() {
            return None;
        }
        let cursor = self.cursor.as_ref()?;

        let mut request =
            Request::get(self.base_path.clone()).with_query("size", cursor.page_size.to_string());
        if let Some(token) = &cursor.token {
            request = request.with_query(self.start_key.clone(), token.clone());
        }
        for (key, value) in &self.extra_query {
            request = request.with_query(key.clone(), value.clone());
        }

        let ticket = RequestTicket::new(self.next_ticket);
        self.next_ticket += 1;
        self.outstanding = Some(ticket);
        Some(ScheduledRequest { ticket, request })
    }

    /// Process the response to the outstanding page request.
    ///
    /// Returns `None` when there is nothing to report: a stale ticket, or a
    /// transient failure that will be retried with the same cursor.
    pub fn handle_response(
        &mut self,
        ticket: RequestTicket,
        response: &Response,
    ) -> Option<Result<DecodedPage<P::Page>, PageError>> {
        if self.outstanding != Some(ticket) {
            debug!(ticket = ticket.value(), "Stale page response ignored");
            return None;
        }
        self.outstanding = None;

        match response.result() {
            ResponseClass::Success => Some(self.decode_page(response)),
            ResponseClass::PermanentError => {
                if self.decoder.should_parse_error(response) {
                    return Some(self.decode_page(response));
                }
                warn!(status = response.status, base_path = %self.base_path, "Listing failed");
                self.finish();
                Some(Err(PageError::Permanent {
                    status: response.status,
                }))
            }
            ResponseClass::TransientError | ResponseClass::Expired => {
                debug!(status = response.status, "Page request will be retried");
                None
            }
        }
    }

    fn decode_page(&mut self, response: &Response) -> Result<DecodedPage<P::Page>, PageError> {
        let page = match self.decoder.decode(response) {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, base_path = %self.base_path, "Could not decode page");
                self.finish();
                return Err(e);
            }
        };

        if let Some(token) = &page.next_token {
            self.last_token = Some(token.clone());
        }

        let advanced = match (self.cursor.as_mut(), &page.next_token) {
            (Some(cursor), Some(token)) if page.has_more => {
                cursor.token = Some(token.clone());
                cursor.has_more = true;
                true
            }
            _ => false,
        };
        if !advanced {
            info!(base_path = %self.base_path, "Listing complete");
            self.finish();
        }
        Ok(page)
    }

    fn finish(&mut self) {
        self.status = PaginatorStatus::Done;
        self.cursor = None;
    }
}
