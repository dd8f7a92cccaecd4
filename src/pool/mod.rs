//! Connection pooling for a single host.
//!
//! The pool holds a bounded array of slots, each of which owns at most one
//! outbound HTTP/1.1 connection and serves at most one request at a time.
//! A [`Pool`] handle submits requests into a dispatcher task; the
//! dispatcher routes them to slots, keeps `min_connections` warm, retries
//! failed idempotent requests, and settles each request's completion
//! handle exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::body::Body;
use crate::conn::Connect;
use crate::error::{ConfigError, Error};
use crate::request::{RequestContext, ResponseHandle};

pub(crate) mod dispatch;
mod slot;
mod state;

use self::dispatch::Dispatcher;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Upper bound on concurrent connections (the number of slots).
    pub max_connections: usize,

    /// Warm-connection floor the dispatcher maintains by pre-connecting.
    pub min_connections: usize,

    /// Requests in flight per connection. Only `1` is supported: pipelining
    /// a second request behind a first blocks it even when another slot
    /// could have served it immediately.
    pub pipelining_limit: usize,

    /// How long a dispatched response may sit before the caller starts
    /// consuming its entity. `None` waits forever.
    pub response_entity_subscription_timeout: Option<Duration>,

    /// Close connections that sit idle longer than this.
    pub idle_timeout: Option<Duration>,

    /// Retire connections older than this once the in-flight exchange
    /// finishes.
    pub max_connection_lifetime: Option<Duration>,

    /// Default retry budget for requests submitted through [`Pool::send`].
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 4,
            min_connections: 0,
            pipelining_limit: 1,
            response_entity_subscription_timeout: Some(Duration::from_secs(1)),
            idle_timeout: Some(Duration::from_secs(90)),
            max_connection_lifetime: None,
            max_retries: 5,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError(
                "min_connections must not exceed max_connections",
            ));
        }
        if self.pipelining_limit != 1 {
            return Err(ConfigError(
                "pipelining is not supported, pipelining_limit must be 1",
            ));
        }
        Ok(())
    }
}

/// Handle to a running connection pool.
///
/// Dropping the handle winds the pool down gracefully: requests already
/// accepted finish, then the dispatcher exits. [`Pool::shutdown`] is
/// immediate and abandons in-flight work with [`Error::Shutdown`].
#[derive(Debug)]
pub struct Pool {
    requests: mpsc::Sender<RequestContext>,
    control: mpsc::Sender<()>,
    max_retries: u32,
    task: JoinHandle<()>,
}

impl Pool {
    /// Start a pool over the given connector.
    pub fn new<C>(connector: C, config: Config) -> Result<Self, ConfigError>
    where
        C: Connect,
    {
        config.validate()?;
        let config = Arc::new(config);
        let (requests, requests_rx) = mpsc::channel(config.max_connections);
        let (control, control_rx) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(
            Arc::new(connector),
            config.clone(),
            requests_rx,
            control_rx,
        );
        let task = tokio::spawn(dispatcher.run());
        Ok(Self {
            requests,
            control,
            max_retries: config.max_retries,
            task,
        })
    }

    /// Submit a request with the configured retry budget.
    ///
    /// Resolves once the pool has accepted the request; while every slot is
    /// busy this applies backpressure to the caller.
    pub async fn send(&self, request: http::Request<Body>) -> Result<ResponseHandle, Error> {
        self.send_with_retries(request, self.max_retries).await
    }

    /// Submit a request with an explicit retry budget.
    pub async fn send_with_retries(
        &self,
        request: http::Request<Body>,
        retries: u32,
    ) -> Result<ResponseHandle, Error> {
        let (context, handle) = RequestContext::new(request, retries);
        self.requests
            .send(context)
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(handle)
    }

    /// Submit a request and await its response.
    pub async fn request(
        &self,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>, Error> {
        self.send(request).await?.await
    }

    /// Shut the pool down immediately. In-flight requests are abandoned and
    /// observe [`Error::Shutdown`]; queued requests are settled with it.
    pub async fn shutdown(self) {
        let _ = self.control.send(()).await;
        let _ = self.task.await;
    }
}
