//! Per-request bookkeeping: the context that travels through the pool and
//! the promise/handle pair the caller awaits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Method, Uri};
use tokio::sync::oneshot;

use crate::body::Body;
use crate::error::Error;

/// One request travelling through the pool.
///
/// The completion handle transitions from pending to settled exactly once
/// over the request's lifetime, either with the response head or with the
/// error that ended the request.
pub(crate) struct RequestContext {
    pub(crate) request: http::Request<Body>,
    pub(crate) promise: ResponsePromise,
    pub(crate) retries_left: u32,
}

impl RequestContext {
    pub(crate) fn new(request: http::Request<Body>, retries_left: u32) -> (Self, ResponseHandle) {
        let (promise, handle) = ResponsePromise::new();
        (
            Self {
                request,
                promise,
                retries_left,
            },
            handle,
        )
    }

    /// Whether this request may safely be sent again on a fresh connection.
    ///
    /// Requires budget, an idempotent method, and an entity that can be
    /// replayed (buffered and not consumed by a previous send attempt).
    pub(crate) fn can_be_retried(&self) -> bool {
        self.retries_left > 0
            && is_idempotent(self.request.method())
            && self.request.body().is_replayable()
    }

    /// Build the copy of the request that goes to the wire.
    ///
    /// Buffered entities are cloned so the original stays replayable; a
    /// streaming entity is moved out and leaves the request non-retryable.
    pub(crate) fn wire_request(&mut self) -> http::Request<Body> {
        let body = self.request.body_mut().for_wire();
        let mut wire = http::Request::new(body);
        *wire.method_mut() = self.request.method().clone();
        *wire.uri_mut() = self.request.uri().clone();
        *wire.version_mut() = self.request.version();
        *wire.headers_mut() = self.request.headers().clone();
        wire
    }

    pub(crate) fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.request.method().clone(),
            uri: self.request.uri().clone(),
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.info())
            .field("retries_left", &self.retries_left)
            .field("settled", &self.promise.is_settled())
            .finish()
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::TRACE
        || *method == Method::PUT
        || *method == Method::DELETE
}

/// Method and URI of a request, retained for logging after the request
/// itself has been relinquished.
#[derive(Debug, Clone)]
pub(crate) struct RequestInfo {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.uri)
    }
}

/// A determined result travelling from a slot back to the dispatcher.
#[derive(Debug)]
pub(crate) struct ResponseContext {
    pub(crate) request: RequestContext,
    pub(crate) result: Result<http::Response<Body>, Error>,
}

/// Sending half of a request's completion handle.
pub(crate) struct ResponsePromise {
    tx: Option<oneshot::Sender<Result<http::Response<Body>, Error>>>,
}

impl ResponsePromise {
    pub(crate) fn new() -> (Self, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, ResponseHandle { rx })
    }

    /// Settle the promise. Settling twice is a bug in the pool; the second
    /// result is dropped.
    pub(crate) fn settle(&mut self, result: Result<http::Response<Body>, Error>) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                debug_assert!(false, "response promise settled twice");
                tracing::error!("response promise settled twice");
            }
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

impl fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Completion handle for a request submitted to the pool.
///
/// Resolves exactly once, with the response head or the error that ended
/// the request. If the pool goes away without settling, the handle
/// resolves with [`Error::Shutdown`].
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<http::Response<Body>, Error>>,
}

impl Future for ResponseHandle {
    type Output = Result<http::Response<Body>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle").finish_non_exhaustive()
    }
}
