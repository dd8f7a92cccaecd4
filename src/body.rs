//! Entity streams for pooled requests and responses.
//!
//! [`Body`] is a small [`http_body::Body`] implementation backed by
//! [`Bytes`]: empty, fully buffered, or fed through a channel. Buffered
//! bodies are *replayable*, which is what makes a failed request eligible
//! for a retry; channel bodies can be sent once.
//!
//! Response bodies handed out by the pool are additionally wrapped in a
//! monitor that reports consumption progress back to the owning slot:
//! first poll, end of stream, or failure.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::pool::dispatch::{Payload, SlotMessage};
use crate::BoxError;

/// Shared cell through which a slot can poison a response body it has
/// already handed downstream (subscription timeout, pool shutdown).
pub(crate) type AbortSlot = Arc<Mutex<Option<Error>>>;

/// An HTTP entity stream, always backed by [`Bytes`].
pub struct Body {
    inner: Inner,
}

enum Inner {
    Empty,
    Full(Bytes),
    Channel(mpsc::Receiver<Result<Bytes, BoxError>>),
    /// A streaming body that has already been handed to a connection.
    Consumed,
    Monitored {
        body: Box<Body>,
        monitor: EntityMonitor,
    },
}

impl Body {
    /// Create an empty body.
    pub fn empty() -> Self {
        Self {
            inner: Inner::Empty,
        }
    }

    /// Create a fully buffered body from anything convertible to [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        Self {
            inner: Inner::Full(data.into()),
        }
    }

    /// Create a streaming body fed through a channel.
    ///
    /// Streaming bodies can be sent exactly once and make a request
    /// ineligible for retries.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<Bytes, BoxError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                inner: Inner::Channel(rx),
            },
        )
    }

    /// A body which can be replayed on a fresh connection.
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self.inner, Inner::Empty | Inner::Full(_))
    }

    /// Produce the copy of this body that goes to the wire.
    ///
    /// Replayable bodies are cloned; a streaming body is moved out, leaving
    /// the original consumed (and therefore no longer replayable).
    pub(crate) fn for_wire(&mut self) -> Body {
        match &self.inner {
            Inner::Empty => Body::empty(),
            Inner::Full(data) => Body::full(data.clone()),
            _ => Body {
                inner: std::mem::replace(&mut self.inner, Inner::Consumed),
            },
        }
    }

    /// Wrap a dispatched response body so consumption is reported to the
    /// slot that owns the connection.
    pub(crate) fn monitored(body: Body, monitor: EntityMonitor) -> Body {
        Body {
            inner: Inner::Monitored {
                body: Box::new(body),
                monitor,
            },
        }
    }

    fn poll_inner(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match &mut self.inner {
            Inner::Empty | Inner::Consumed => Poll::Ready(None),
            Inner::Full(_) => {
                let Inner::Full(data) = std::mem::replace(&mut self.inner, Inner::Empty) else {
                    unreachable!()
                };
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Inner::Channel(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(data))) => Poll::Ready(Some(Ok(Frame::data(data)))),
                Poll::Ready(Some(Err(cause))) => Poll::Ready(Some(Err(cause))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            Inner::Monitored { body, monitor } => {
                if let Some(cause) = monitor.aborted() {
                    return Poll::Ready(Some(Err(cause.into())));
                }
                monitor.subscribed();
                match body.poll_inner(cx) {
                    Poll::Ready(None) => {
                        monitor.completed();
                        Poll::Ready(None)
                    }
                    Poll::Ready(Some(Err(cause))) => {
                        monitor.failed(cause.to_string());
                        Poll::Ready(Some(Err(cause)))
                    }
                    other => other,
                }
            }
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut().poll_inner(cx)
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Inner::Empty | Inner::Consumed => true,
            Inner::Full(_) | Inner::Channel(_) => false,
            Inner::Monitored { body, .. } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Inner::Empty | Inner::Consumed => SizeHint::with_exact(0),
            Inner::Full(data) => SizeHint::with_exact(data.len() as u64),
            Inner::Channel(_) => SizeHint::default(),
            Inner::Monitored { body, .. } => body.size_hint(),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::full(data)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Inner::Empty => "Empty",
            Inner::Full(_) => "Full",
            Inner::Channel(_) => "Channel",
            Inner::Consumed => "Consumed",
            Inner::Monitored { .. } => "Monitored",
        };
        f.debug_tuple("Body").field(&kind).finish()
    }
}

/// Reports consumption of a dispatched response entity back to its slot.
///
/// Signals are tagged with the connection generation so that a slot which
/// has already moved on can discard them.
pub(crate) struct EntityMonitor {
    events: mpsc::UnboundedSender<SlotMessage>,
    slot: usize,
    generation: u64,
    abort: AbortSlot,
    subscribed: bool,
    finished: bool,
}

impl EntityMonitor {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<SlotMessage>,
        slot: usize,
        generation: u64,
        abort: AbortSlot,
    ) -> Self {
        Self {
            events,
            slot,
            generation,
            abort,
            subscribed: false,
            finished: false,
        }
    }

    fn send(&self, payload: Payload) {
        let _ = self.events.send(SlotMessage {
            slot: self.slot,
            generation: self.generation,
            payload,
        });
    }

    fn aborted(&mut self) -> Option<Error> {
        let cause = self.abort.lock().take();
        if cause.is_some() {
            self.finished = true;
        }
        cause
    }

    fn subscribed(&mut self) {
        if !self.subscribed {
            self.subscribed = true;
            self.send(Payload::EntitySubscribed);
        }
    }

    fn completed(&mut self) {
        if !self.finished {
            self.finished = true;
            self.send(Payload::EntityCompleted);
        }
    }

    fn failed(&mut self, cause: String) {
        if !self.finished {
            self.finished = true;
            self.send(Payload::EntityFailed(cause.into()));
        }
    }
}

impl Drop for EntityMonitor {
    fn drop(&mut self) {
        // A body dropped mid-stream counts as a failed subscription: the
        // slot must not reuse a connection with unread response bytes.
        if !self.finished {
            if !self.subscribed {
                self.subscribed = true;
                self.send(Payload::EntitySubscribed);
            }
            self.send(Payload::EntityFailed(
                "response entity dropped before end of stream".into(),
            ));
        }
    }
}

impl fmt::Debug for EntityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMonitor")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("subscribed", &self.subscribed)
            .field("finished", &self.finished)
            .finish()
    }
}
