//! Valet
//!
//! A bounded HTTP/1.1 client connection pool for a single host.
//!
//! The pool is organized around *slots*: each slot owns at most one
//! outbound connection and at most one in-flight request, and is driven by
//! a pure state machine that coordinates the four asynchronous signals of
//! an HTTP/1.1 exchange (connection lifecycle, request entity completion,
//! response head arrival, response entity consumption). A single
//! dispatcher task routes requests onto slots, keeps a warm-connection
//! floor, and applies the retry budget for idempotent requests.
//!
//! Dialing and wire framing are not part of this crate; they are supplied
//! through the [`conn::Connect`] interface. An in-memory implementation
//! for tests lives in [`conn::mock`].

pub mod body;
pub use body::Body;
pub mod conn;
pub mod error;
pub use error::{ConfigError, Error};
pub mod pool;
pub use pool::{Config, Pool};
mod request;
pub use request::ResponseHandle;

/// Boxed error type used at the crate's collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
