//! Error types for pooled requests.

use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// Ways a pooled request or its entity streams can fail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The TCP (or TLS) session could not be established.
    #[error("connect: {0}")]
    Connect(#[source] BoxError),

    /// The request entity stream failed before it was fully written.
    #[error("request entity: {0}")]
    RequestEntity(#[source] BoxError),

    /// The connection failed while an exchange was in flight.
    #[error("connection: {0}")]
    Connection(#[source] BoxError),

    /// The connection closed before the response head arrived.
    #[error("connection closed before the response was received")]
    UnexpectedClose,

    /// The response entity stream failed after the head was delivered.
    #[error("response entity: {0}")]
    ResponseEntity(#[source] BoxError),

    /// The response entity was not consumed within the configured window.
    #[error("response entity was not subscribed within {0:?}")]
    SubscriptionTimeout(Duration),

    /// The pool is shutting down.
    #[error("pool is shutting down")]
    Shutdown,
}

/// The pool configuration is unusable.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid pool configuration: {0}")]
pub struct ConfigError(pub(crate) &'static str);
