//! An in-memory connector for exercising the pool without a network.
//!
//! The mock dials instantly and answers every request through a
//! configurable handler. Failure injection covers the two interesting
//! classes: dial failures and connections that die mid-exchange.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::body::Body;
use crate::BoxError;

use super::{Connect, ConnectionEvent, Established, OutgoingConnection};

/// Error produced by injected dial failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("mock connect error")]
pub struct MockConnectError;

type Handler = Arc<dyn Fn(http::Request<Body>) -> http::Response<Body> + Send + Sync>;

/// A scriptable [`Connect`] implementation.
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<MockInner>,
}

struct MockInner {
    connects: AtomicUsize,
    live: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_requests: AtomicUsize,
    stall: AtomicBool,
    handler: Mutex<Handler>,
}

impl MockConnector {
    /// A connector whose connections answer every request with an empty
    /// `200 OK`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                connects: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                fail_requests: AtomicUsize::new(0),
                stall: AtomicBool::new(false),
                handler: Mutex::new(Arc::new(|_| http::Response::new(Body::empty()))),
            }),
        }
    }

    /// Replace the response handler.
    pub fn respond_with<F>(&self, handler: F)
    where
        F: Fn(http::Request<Body>) -> http::Response<Body> + Send + Sync + 'static,
    {
        *self.inner.handler.lock() = Arc::new(handler);
    }

    /// Fail the next `count` dial attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Kill the connection instead of answering, for the next `count`
    /// requests.
    pub fn fail_next_requests(&self, count: usize) {
        self.inner.fail_requests.store(count, Ordering::SeqCst);
    }

    /// Accept requests but never answer them.
    pub fn stall(&self, stall: bool) {
        self.inner.stall.store(stall, Ordering::SeqCst);
    }

    /// Dial attempts made so far, including failed ones.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections whose drivers are still running.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("connects", &self.connects())
            .field("live", &self.live())
            .finish()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            current.checked_sub(1)
        })
        .is_ok()
}

impl Connect for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Established, BoxError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.connects.fetch_add(1, Ordering::SeqCst);
            if take_one(&inner.fail_connects) {
                return Err(MockConnectError.into());
            }

            let (connection, mut requests) = OutgoingConnection::new();
            let (events, stream) = mpsc::channel(8);

            inner.live.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    if events
                        .send(ConnectionEvent::RequestEntitySent)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if inner.stall.load(Ordering::SeqCst) {
                        continue;
                    }
                    if take_one(&inner.fail_requests) {
                        let _ = events
                            .send(ConnectionEvent::Failed("mock connection died".into()))
                            .await;
                        break;
                    }
                    let handler = inner.handler.lock().clone();
                    let response = handler(request);
                    if events.send(ConnectionEvent::Response(response)).await.is_err() {
                        break;
                    }
                }
                inner.live.fetch_sub(1, Ordering::SeqCst);
            });

            Ok((connection, stream))
        })
    }
}
