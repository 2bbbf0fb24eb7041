//! Fixed-precedence composition of request sources.
//!
//! The [`RequestAggregator`] owns an ordered list of [`RequestSource`]s and
//! asks them for work in that order; the first source with a request wins.
//! Earlier sources therefore take priority (for example the notification
//! stream before steady-state entity sync).
//!
//! Each outbound request carries a [`RequestRoute`] so the response can be
//! handed back to the source that produced it.
//!
//! The aggregator must be torn down with [`RequestAggregator::tear_down`]
//! before it is dropped.

use std::fmt;
use sync_types::{Request, Response};
use tracing::{debug, error, info};

use crate::queue::{RequestTicket, ScheduledRequest};

/// Something that produces requests and consumes their responses.
pub trait RequestSource: Send {
    /// The next request this source wants sent, if any.
    fn next_request(&mut self) -> Option<ScheduledRequest>;

    /// Receive the response to a request previously returned by
    /// [`next_request`](Self::next_request).
    fn handle_response(&mut self, ticket: RequestTicket, response: &Response);

    /// Release resources held by the source.
    fn tear_down(&mut self) {}
}

/// Position of a source within the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

impl SourceId {
    /// Index in precedence order (0 = highest).
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where to deliver the response of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRoute {
    source: SourceId,
    ticket: RequestTicket,
}

impl RequestRoute {
    /// The source that produced the request.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// The source-local ticket.
    pub fn ticket(&self) -> RequestTicket {
        self.ticket
    }
}

/// A request together with its route back.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Pass this to [`RequestAggregator::complete`].
    pub route: RequestRoute,
    /// The request to send.
    pub request: Request,
}

/// Ordered list of request sources.
pub struct RequestAggregator {
    sources: Vec<Box<dyn RequestSource>>,
    torn_down: bool,
}

impl RequestAggregator {
    /// Create an aggregator without sources.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            torn_down: false,
        }
    }

    /// Append a source with lower precedence than all existing ones.
    pub fn add_source(&mut self, source: Box<dyn RequestSource>) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(source);
        id
    }

    /// Builder form of [`add_source`](Self::add_source).
    pub fn with_source(mut self, source: impl RequestSource + 'static) -> Self {
        self.add_source(Box::new(source));
        self
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether there are no sources.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Whether [`tear_down`](Self::tear_down) has been called.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// First request from the sources, in precedence order.
    pub fn next_request(&mut self) -> Option<OutboundRequest> {
        if self.torn_down {
            return None;
        }
        self.sources
            .iter_mut()
            .enumerate()
            .find_map(|(index, source)| {
                source.next_request().map(|scheduled| OutboundRequest {
                    route: RequestRoute {
                        source: SourceId(index),
                        ticket: scheduled.ticket,
                    },
                    request: scheduled.request,
                })
            })
            .inspect(|outbound| {
                debug!(source = outbound.route.source.0, request = %outbound.request, "Next request");
            })
    }

    /// Deliver a response to the source that produced the request.
    pub fn complete(&mut self, route: RequestRoute, response: &Response) {
        match self.sources.get_mut(route.source.0) {
            Some(source) => source.handle_response(route.ticket, response),
            None => error!(source = route.source.0, "Response for unknown source dropped"),
        }
    }

    /// Tear down every source. Further calls are no-ops.
    pub fn tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        for source in &mut self.sources {
            source.tear_down();
        }
        self.torn_down = true;
        info!(sources = self.sources.len(), "Request aggregator torn down");
    }
}

impl Default for RequestAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAggregator")
            .field("sources", &self.sources.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl Drop for RequestAggregator {
    fn drop(&mut self) {
        if !self.torn_down && !std::thread::panicking() {
            error!("Request aggregator dropped without tear_down");
            debug_assert!(self.torn_down, "tear_down must be called before drop");
        }
    }
}
