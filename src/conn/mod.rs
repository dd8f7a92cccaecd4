//! How the pool reaches the wire.
//!
//! Dialing and HTTP/1.1 framing live outside this crate. A [`Connect`]
//! implementation establishes one outbound session and hands back an
//! [`OutgoingConnection`] through which the pool pushes requests, plus an
//! event stream through which the wire driver reports progress. The pool
//! never inspects the connection beyond pushing requests into it.

use futures_core::future::BoxFuture;
use http::header::CONNECTION;
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::mpsc;

use crate::body::Body;
use crate::BoxError;

pub mod mock;

/// Events reported by the wire driver behind an established connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The request entity has been fully written to the wire.
    RequestEntitySent,
    /// The request entity stream failed before it was fully written.
    RequestEntityFailed(BoxError),
    /// A response head arrived; its entity streams through the body.
    Response(http::Response<Body>),
    /// The connection reached an orderly end of life.
    Closed,
    /// The connection failed.
    Failed(BoxError),
}

/// An established connection: the request handle plus the wire driver's
/// event stream.
pub type Established = (OutgoingConnection, mpsc::Receiver<ConnectionEvent>);

/// Dials new connections to the host this pool serves.
pub trait Connect: Send + Sync + 'static {
    /// Establish a TCP (optionally TLS) session and spawn its wire driver.
    fn connect(&self) -> BoxFuture<'static, Result<Established, BoxError>>;
}

/// Opaque handle to one established outbound connection.
///
/// The wire driver behind it owns framing; the pool only pushes requests
/// through and observes the driver's event stream.
pub struct OutgoingConnection {
    requests: mpsc::UnboundedSender<http::Request<Body>>,
}

impl OutgoingConnection {
    /// Create a connection handle together with the request stream the
    /// wire driver reads from. Used by [`Connect`] implementations.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<http::Request<Body>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { requests: tx }, rx)
    }

    pub(crate) fn push(&self, request: http::Request<Body>) -> Result<(), BoxError> {
        self.requests
            .send(request)
            .map_err(|_| BoxError::from("connection driver is gone"))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

impl std::fmt::Debug for OutgoingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Retained head of a response whose body has been handed downstream.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    pub(crate) fn of(response: &http::Response<Body>) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
        }
    }
}

/// HTTP/1.1 connection semantics: must the connection be closed once this
/// response has been delivered?
pub(crate) fn will_close_after(response: &ResponseHead) -> bool {
    if connection_header_contains(&response.headers, "close") {
        return true;
    }
    match response.version {
        Version::HTTP_10 | Version::HTTP_09 => {
            !connection_header_contains(&response.headers, "keep-alive")
        }
        _ => false,
    }
}

fn connection_header_contains(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|value| {
                value
                    .split(',')
                    .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}
