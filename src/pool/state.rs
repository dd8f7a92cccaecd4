//! The per-slot connection state machine.
//!
//! A slot is one logical outbound connection position within the pool. Its
//! phase is a pure value; every asynchronous signal is an [`Event`], and
//! [`SlotState::step`] maps the current phase and an event to the next
//! phase. The machine performs no I/O and reads no clock: side effects are
//! requested through [`SlotContext`], which the slot runtime passes in on
//! every call.
//!
//! Events that have no transition from the current phase are programming
//! errors, not recoverable conditions; `step` reports them as a
//! [`SlotFault`] and the runtime tears the slot down.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::body::Body;
use crate::conn::ResponseHead;
use crate::error::Error;
use crate::request::{RequestContext, RequestInfo, ResponseContext};

use super::Config;

/// Effects and queries the state machine requests from its slot runtime.
pub(crate) trait SlotContext {
    /// Begin dialing a new connection for this slot.
    fn open_connection(&mut self);

    /// Hand a request to the established connection for framing.
    fn push_request(&mut self, request: http::Request<Body>);

    /// Report a determined result upstream to the dispatcher.
    fn dispatch_response(&mut self, response: ResponseContext);

    /// Has the connection owned by this slot stopped being usable?
    fn is_connection_closed(&self) -> bool;

    /// Must the connection close once this response has been delivered?
    fn will_close_after(&self, response: &ResponseHead) -> bool;

    fn settings(&self) -> &Config;
}

/// One asynchronous signal delivered to a slot.
#[derive(Debug)]
pub(crate) enum Event {
    PreConnect,
    NewRequest(RequestContext),
    ConnectionAttemptSucceeded,
    ConnectionAttemptFailed(Error),
    RequestEntityCompleted,
    RequestEntityFailed(Error),
    ResponseReceived(http::Response<Body>),
    ResponseDispatchable,
    ResponseEntitySubscribed,
    ResponseEntityCompleted,
    ResponseEntityFailed(Error),
    ConnectionCompleted,
    ConnectionFailed(Error),
    Timeout,
    Shutdown,
}

impl Event {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Event::PreConnect => "PreConnect",
            Event::NewRequest(_) => "NewRequest",
            Event::ConnectionAttemptSucceeded => "ConnectionAttemptSucceeded",
            Event::ConnectionAttemptFailed(_) => "ConnectionAttemptFailed",
            Event::RequestEntityCompleted => "RequestEntityCompleted",
            Event::RequestEntityFailed(_) => "RequestEntityFailed",
            Event::ResponseReceived(_) => "ResponseReceived",
            Event::ResponseDispatchable => "ResponseDispatchable",
            Event::ResponseEntitySubscribed => "ResponseEntitySubscribed",
            Event::ResponseEntityCompleted => "ResponseEntityCompleted",
            Event::ResponseEntityFailed(_) => "ResponseEntityFailed",
            Event::ConnectionCompleted => "ConnectionCompleted",
            Event::ConnectionFailed(_) => "ConnectionFailed",
            Event::Timeout => "Timeout",
            Event::Shutdown => "Shutdown",
        }
    }
}

/// Phase of one pool slot.
///
/// Each variant carries exactly the data needed to resume. `entity_pending`
/// tracks whether the request entity stream has signalled completion yet;
/// it may resolve before or after the response head arrives.
#[derive(Debug)]
pub(crate) enum SlotState {
    /// No socket, no request.
    Unconnected,
    /// Dialing a warm connection; no request yet.
    PreConnecting,
    /// Dialing to serve a specific request.
    Connecting(RequestContext),
    /// Open connection, nothing in flight.
    Idle,
    /// Request head pushed; awaiting the response head.
    WaitingForResponse {
        request: RequestContext,
        entity_pending: bool,
    },
    /// Result determined; waiting on downstream readiness.
    WaitingForResponseDispatch {
        request: RequestContext,
        result: Result<http::Response<Body>, Error>,
        entity_pending: bool,
    },
    /// Response delivered; the caller has not yet touched its entity.
    WaitingForResponseEntitySubscription {
        request: RequestInfo,
        response: ResponseHead,
        timeout: Option<Duration>,
        entity_pending: bool,
    },
    /// Response entity being consumed by the caller.
    WaitingForEndOfResponseEntity {
        request: RequestInfo,
        response: ResponseHead,
        entity_pending: bool,
    },
    /// Response fully done; the request entity is still streaming.
    WaitingForEndOfRequestEntity,
}

impl SlotState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SlotState::Unconnected => "Unconnected",
            SlotState::PreConnecting => "PreConnecting",
            SlotState::Connecting(_) => "Connecting",
            SlotState::Idle => "Idle",
            SlotState::WaitingForResponse { .. } => "WaitingForResponse",
            SlotState::WaitingForResponseDispatch { .. } => "WaitingForResponseDispatch",
            SlotState::WaitingForResponseEntitySubscription { .. } => {
                "WaitingForResponseEntitySubscription"
            }
            SlotState::WaitingForEndOfResponseEntity { .. } => "WaitingForEndOfResponseEntity",
            SlotState::WaitingForEndOfRequestEntity => "WaitingForEndOfRequestEntity",
        }
    }

    /// The slot owns, or is establishing, a connection.
    pub(crate) fn is_connected(&self) -> bool {
        !matches!(self, SlotState::Unconnected)
    }

    /// The slot can accept a new request.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(
            self,
            SlotState::Unconnected | SlotState::PreConnecting | SlotState::Idle
        )
    }

    /// Timeout the runtime arms on entry to this state.
    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self {
            SlotState::WaitingForResponseEntitySubscription { timeout, .. } => *timeout,
            _ => None,
        }
    }

    /// Advance the machine by one event.
    pub(crate) fn step(
        self,
        event: Event,
        cx: &mut dyn SlotContext,
    ) -> Result<SlotState, SlotFault> {
        use SlotState::*;

        if let Event::Shutdown = event {
            return Ok(self.on_shutdown());
        }

        let next = match (self, event) {
            (Unconnected, Event::PreConnect) => {
                cx.open_connection();
                PreConnecting
            }
            (Unconnected, Event::NewRequest(request)) => {
                cx.open_connection();
                Connecting(request)
            }

            (PreConnecting, Event::ConnectionAttemptSucceeded) => Idle,
            // A request may latch onto a dial that is already in flight.
            (PreConnecting, Event::NewRequest(request)) => Connecting(request),
            (PreConnecting, Event::ConnectionAttemptFailed(cause)) => {
                debug!(%cause, "warm connection attempt failed");
                Unconnected
            }
            (PreConnecting, Event::ConnectionFailed(cause)) => {
                debug!(%cause, "warm connection failed");
                Unconnected
            }
            (PreConnecting, Event::ConnectionCompleted) => Unconnected,

            (Connecting(mut request), Event::ConnectionAttemptSucceeded) => {
                let wire = request.wire_request();
                cx.push_request(wire);
                WaitingForResponse {
                    request,
                    entity_pending: true,
                }
            }
            (Connecting(request), Event::ConnectionAttemptFailed(cause)) => {
                fail_undispatched(cx, request, false, cause)
            }
            (Connecting(request), Event::ConnectionFailed(cause)) => {
                fail_undispatched(cx, request, false, cause)
            }
            (Connecting(request), Event::ConnectionCompleted) => {
                fail_undispatched(cx, request, false, Error::UnexpectedClose)
            }

            (Idle, Event::NewRequest(mut request)) => {
                let wire = request.wire_request();
                cx.push_request(wire);
                WaitingForResponse {
                    request,
                    entity_pending: true,
                }
            }
            (Idle, Event::ConnectionCompleted) => Unconnected,
            (Idle, Event::ConnectionFailed(cause)) => {
                debug!(%cause, "idle connection failed");
                Unconnected
            }

            (
                WaitingForResponse {
                    request,
                    entity_pending: true,
                },
                Event::RequestEntityCompleted,
            ) => WaitingForResponse {
                request,
                entity_pending: false,
            },
            (
                WaitingForResponse {
                    request,
                    entity_pending,
                },
                Event::ResponseReceived(response),
            ) => {
                trace!(request = %request.info(), status = %response.status(), "response head received");
                WaitingForResponseDispatch {
                    request,
                    result: Ok(response),
                    entity_pending,
                }
            }
            (WaitingForResponse { request, .. }, Event::RequestEntityFailed(cause)) => {
                fail_undispatched(cx, request, false, cause)
            }
            (
                WaitingForResponse {
                    request,
                    entity_pending,
                },
                Event::ConnectionFailed(cause),
            ) => fail_undispatched(cx, request, entity_pending, cause),
            (
                WaitingForResponse {
                    request,
                    entity_pending,
                },
                Event::ConnectionCompleted,
            ) => fail_undispatched(cx, request, entity_pending, Error::UnexpectedClose),

            (
                WaitingForResponseDispatch {
                    request,
                    result,
                    entity_pending: true,
                },
                Event::RequestEntityCompleted,
            ) => WaitingForResponseDispatch {
                request,
                result,
                entity_pending: false,
            },
            (
                WaitingForResponseDispatch {
                    request,
                    result,
                    entity_pending: true,
                },
                Event::RequestEntityFailed(cause),
            ) => {
                // The result is already determined; the broken connection
                // just cannot be reused afterwards.
                debug!(request = %request.info(), %cause, "request entity failed after the result was determined");
                WaitingForResponseDispatch {
                    request,
                    result,
                    entity_pending: false,
                }
            }
            (
                WaitingForResponseDispatch {
                    request,
                    result,
                    entity_pending,
                },
                Event::ResponseDispatchable,
            ) => match result {
                Ok(response) => {
                    let info = request.info();
                    let head = ResponseHead::of(&response);
                    let timeout = cx.settings().response_entity_subscription_timeout;
                    cx.dispatch_response(ResponseContext {
                        request,
                        result: Ok(response),
                    });
                    WaitingForResponseEntitySubscription {
                        request: info,
                        response: head,
                        timeout,
                        entity_pending,
                    }
                }
                Err(cause) => {
                    cx.dispatch_response(ResponseContext {
                        request,
                        result: Err(cause),
                    });
                    Unconnected
                }
            },
            (
                state @ WaitingForResponseDispatch { .. },
                Event::ConnectionCompleted | Event::ConnectionFailed(_),
            ) => state,

            (
                WaitingForResponseEntitySubscription {
                    request,
                    response,
                    timeout,
                    entity_pending: true,
                },
                Event::RequestEntityCompleted,
            ) => WaitingForResponseEntitySubscription {
                request,
                response,
                timeout,
                entity_pending: false,
            },
            (
                WaitingForResponseEntitySubscription {
                    request,
                    response,
                    timeout,
                    entity_pending: true,
                },
                Event::RequestEntityFailed(cause),
            ) => {
                debug!(request = %request, %cause, "request entity failed after dispatch");
                WaitingForResponseEntitySubscription {
                    request,
                    response,
                    timeout,
                    entity_pending: false,
                }
            }
            (
                WaitingForResponseEntitySubscription {
                    request,
                    response,
                    entity_pending,
                    ..
                },
                Event::ResponseEntitySubscribed,
            ) => WaitingForEndOfResponseEntity {
                request,
                response,
                entity_pending,
            },
            (
                WaitingForResponseEntitySubscription {
                    request, timeout, ..
                },
                Event::Timeout,
            ) => {
                warn!(request = %request, timeout = ?timeout, "response entity was not subscribed in time, closing connection");
                Unconnected
            }
            (
                state @ WaitingForResponseEntitySubscription { .. },
                Event::ConnectionCompleted | Event::ConnectionFailed(_),
            ) => state,

            (
                WaitingForEndOfResponseEntity {
                    request,
                    response,
                    entity_pending: true,
                },
                Event::RequestEntityCompleted,
            ) => WaitingForEndOfResponseEntity {
                request,
                response,
                entity_pending: false,
            },
            (
                WaitingForEndOfResponseEntity {
                    request,
                    response,
                    entity_pending: true,
                },
                Event::RequestEntityFailed(cause),
            ) => {
                debug!(request = %request, %cause, "request entity failed while the response entity was being read");
                WaitingForEndOfResponseEntity {
                    request,
                    response,
                    entity_pending: false,
                }
            }
            (
                WaitingForEndOfResponseEntity {
                    request,
                    response,
                    entity_pending,
                },
                Event::ResponseEntityCompleted,
            ) => {
                if entity_pending {
                    WaitingForEndOfRequestEntity
                } else if cx.will_close_after(&response) || cx.is_connection_closed() {
                    trace!(request = %request, "exchange complete, connection will not be reused");
                    Unconnected
                } else {
                    trace!(request = %request, "exchange complete, connection idle");
                    Idle
                }
            }
            (WaitingForEndOfResponseEntity { request, .. }, Event::ResponseEntityFailed(cause)) => {
                debug!(request = %request, %cause, "response entity failed");
                Unconnected
            }
            (
                state @ WaitingForEndOfResponseEntity { .. },
                Event::ConnectionCompleted | Event::ConnectionFailed(_),
            ) => state,

            (WaitingForEndOfRequestEntity, Event::RequestEntityCompleted) => {
                if cx.is_connection_closed() {
                    Unconnected
                } else {
                    Idle
                }
            }
            (WaitingForEndOfRequestEntity, Event::RequestEntityFailed(cause)) => {
                debug!(%cause, "request entity failed after the response was fully read");
                if cx.is_connection_closed() {
                    Unconnected
                } else {
                    Idle
                }
            }
            (
                WaitingForEndOfRequestEntity,
                Event::ConnectionCompleted | Event::ConnectionFailed(_),
            ) => Unconnected,

            (state, event) => {
                return Err(SlotFault {
                    state: state.name(),
                    event: event.name(),
                })
            }
        };

        Ok(next)
    }

    /// The pool is closing. Busy slots drop their request; the dispatcher
    /// is responsible for settling abandoned completion handles.
    fn on_shutdown(self) -> SlotState {
        match self {
            SlotState::Connecting(request)
            | SlotState::WaitingForResponse { request, .. }
            | SlotState::WaitingForResponseDispatch { request, .. } => {
                warn!(request = %request.info(), "dropping in-flight request, pool is shutting down");
                SlotState::Unconnected
            }
            SlotState::WaitingForResponseEntitySubscription { request, .. }
            | SlotState::WaitingForEndOfResponseEntity { request, .. } => {
                warn!(request = %request, "abandoning response entity, pool is shutting down");
                SlotState::Unconnected
            }
            _ => SlotState::Unconnected,
        }
    }
}

/// A failure arrived while the slot still holds an undispatched request.
///
/// Retryable requests go straight back to the dispatcher, which decides
/// whether to re-enqueue them; everything else is reported through the
/// normal dispatch ordering.
fn fail_undispatched(
    cx: &mut dyn SlotContext,
    request: RequestContext,
    entity_pending: bool,
    cause: Error,
) -> SlotState {
    if request.can_be_retried() {
        debug!(
            request = %request.info(),
            retries_left = request.retries_left,
            %cause,
            "request failed, returning it to the dispatcher for retry"
        );
        cx.dispatch_response(ResponseContext {
            request,
            result: Err(cause),
        });
        if entity_pending {
            SlotState::WaitingForEndOfRequestEntity
        } else {
            SlotState::Unconnected
        }
    } else {
        debug!(request = %request.info(), %cause, "request failed");
        SlotState::WaitingForResponseDispatch {
            request,
            result: Err(cause),
            entity_pending,
        }
    }
}

/// An event arrived in a state that has no transition for it.
///
/// This is a bug in the pool, not an I/O condition; the runtime tears the
/// slot down when it sees one.
#[derive(Debug, Error)]
#[error("slot received {event} while {state}")]
pub(crate) struct SlotFault {
    pub(crate) state: &'static str,
    pub(crate) event: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::Method;

    use crate::request::ResponseHandle;

    #[derive(Default)]
    struct TestContext {
        config: Config,
        opened: usize,
        pushed: Vec<http::Request<Body>>,
        dispatched: Vec<ResponseContext>,
        connection_closed: bool,
        close_after: bool,
    }

    impl SlotContext for TestContext {
        fn open_connection(&mut self) {
            self.opened += 1;
        }

        fn push_request(&mut self, request: http::Request<Body>) {
            self.pushed.push(request);
        }

        fn dispatch_response(&mut self, response: ResponseContext) {
            self.dispatched.push(response);
        }

        fn is_connection_closed(&self) -> bool {
            self.connection_closed
        }

        fn will_close_after(&self, _response: &ResponseHead) -> bool {
            self.close_after
        }

        fn settings(&self) -> &Config {
            &self.config
        }
    }

    fn request(method: Method, retries: u32) -> (RequestContext, ResponseHandle) {
        let request = http::Request::builder()
            .method(method)
            .uri("http://upstream.test/")
            .body(Body::empty())
            .unwrap();
        RequestContext::new(request, retries)
    }

    fn response() -> http::Response<Body> {
        http::Response::new(Body::empty())
    }

    fn step(state: SlotState, event: Event, cx: &mut TestContext) -> SlotState {
        state.step(event, cx).expect("legal transition")
    }

    #[test]
    fn happy_path_reuses_the_connection() {
        let mut cx = TestContext::default();
        let (context, handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        assert_eq!(state.name(), "Connecting");
        assert_eq!(cx.opened, 1);

        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        assert_eq!(state.name(), "WaitingForResponse");
        assert_eq!(cx.pushed.len(), 1);

        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        assert_eq!(state.name(), "WaitingForResponse");

        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        assert_eq!(state.name(), "WaitingForResponseDispatch");
        assert!(cx.dispatched.is_empty());

        let state = step(state, Event::ResponseDispatchable, &mut cx);
        assert_eq!(state.name(), "WaitingForResponseEntitySubscription");
        assert_eq!(cx.dispatched.len(), 1);

        let state = step(state, Event::ResponseEntitySubscribed, &mut cx);
        assert_eq!(state.name(), "WaitingForEndOfResponseEntity");

        let state = step(state, Event::ResponseEntityCompleted, &mut cx);
        assert_eq!(state.name(), "Idle");

        // The dispatcher settles the promise from the dispatched result.
        let ResponseContext {
            mut request,
            result,
        } = cx.dispatched.remove(0);
        assert!(result.is_ok());
        request.promise.settle(result);
        let settled = poll_settled(handle);
        assert!(settled.is_ok());
    }

    // Minimal block_on so machine tests stay free of a runtime.
    fn poll_settled(
        handle: ResponseHandle,
    ) -> Result<http::Response<Body>, Error> {
        use std::future::Future;
        use std::pin::pin;
        use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

        fn noop_raw_waker() -> RawWaker {
            fn clone(_: *const ()) -> RawWaker {
                noop_raw_waker()
            }
            fn noop(_: *const ()) {}
            RawWaker::new(
                std::ptr::null(),
                &RawWakerVTable::new(clone, noop, noop, noop),
            )
        }

        let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
        let mut cx = Context::from_waker(&waker);
        match pin!(handle).poll(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => panic!("handle should be settled"),
        }
    }

    #[test]
    fn dial_failure_returns_a_retryable_request_to_the_dispatcher() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 2);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(
            state,
            Event::ConnectionAttemptFailed(Error::Connect("refused".into())),
            &mut cx,
        );

        assert_eq!(state.name(), "Unconnected");
        assert_eq!(cx.dispatched.len(), 1);
        let dispatched = &cx.dispatched[0];
        assert!(dispatched.result.is_err());
        assert!(dispatched.request.can_be_retried());
        assert!(!dispatched.request.promise.is_settled());
    }

    #[test]
    fn non_retryable_failure_reports_through_dispatch_ordering() {
        let mut cx = TestContext::default();
        let (context, handle) = request(Method::POST, 2);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        assert_eq!(state.name(), "WaitingForResponse");

        let state = step(
            state,
            Event::ConnectionFailed(Error::Connection("reset".into())),
            &mut cx,
        );
        assert_eq!(state.name(), "WaitingForResponseDispatch");
        assert!(cx.dispatched.is_empty());

        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        assert_eq!(state.name(), "WaitingForResponseDispatch");

        let state = step(state, Event::ResponseDispatchable, &mut cx);
        assert_eq!(state.name(), "Unconnected");
        assert_eq!(cx.dispatched.len(), 1);

        let ResponseContext {
            mut request,
            result,
        } = cx.dispatched.remove(0);
        request.promise.settle(result);
        assert!(matches!(
            poll_settled(handle),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn subscription_timeout_forces_the_connection_closed() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        let state = step(state, Event::ResponseDispatchable, &mut cx);
        assert_eq!(state.name(), "WaitingForResponseEntitySubscription");
        assert_eq!(
            state.timeout(),
            cx.config.response_entity_subscription_timeout
        );

        let state = step(state, Event::Timeout, &mut cx);
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn preconnect_then_late_request_latches_on() {
        let mut cx = TestContext::default();

        let state = step(SlotState::Unconnected, Event::PreConnect, &mut cx);
        assert_eq!(state.name(), "PreConnecting");
        assert_eq!(cx.opened, 1);

        let (context, _handle) = request(Method::GET, 0);
        let state = step(state, Event::NewRequest(context), &mut cx);
        assert_eq!(state.name(), "Connecting");
        // The dial already in flight serves the request; no second dial.
        assert_eq!(cx.opened, 1);

        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        assert_eq!(state.name(), "WaitingForResponse");
        assert_eq!(cx.pushed.len(), 1);
    }

    #[test]
    fn server_close_directive_prevents_reuse() {
        let mut cx = TestContext::default();
        cx.close_after = true;
        let (context, _handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        let state = step(state, Event::ResponseDispatchable, &mut cx);
        let state = step(state, Event::ResponseEntitySubscribed, &mut cx);
        let state = step(state, Event::ResponseEntityCompleted, &mut cx);
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn response_may_finish_before_the_request_entity() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        let state = step(state, Event::ResponseDispatchable, &mut cx);
        let state = step(state, Event::ResponseEntitySubscribed, &mut cx);

        // Entity still pending when the response entity completes.
        let state = step(state, Event::ResponseEntityCompleted, &mut cx);
        assert_eq!(state.name(), "WaitingForEndOfRequestEntity");

        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        assert_eq!(state.name(), "Idle");
    }

    #[test]
    fn request_entity_completion_after_close_drops_to_unconnected() {
        let mut cx = TestContext::default();
        cx.connection_closed = true;

        let state = step(
            SlotState::WaitingForEndOfRequestEntity,
            Event::RequestEntityCompleted,
            &mut cx,
        );
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn retryable_failure_with_pending_entity_waits_for_it() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 1);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(
            state,
            Event::ConnectionFailed(Error::Connection("reset".into())),
            &mut cx,
        );

        assert_eq!(state.name(), "WaitingForEndOfRequestEntity");
        assert_eq!(cx.dispatched.len(), 1);

        cx.connection_closed = true;
        let state = step(
            state,
            Event::RequestEntityFailed(Error::RequestEntity("aborted".into())),
            &mut cx,
        );
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn post_dispatch_states_ignore_connection_events() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        let state = step(state, Event::ResponseDispatchable, &mut cx);

        let state = step(state, Event::ConnectionCompleted, &mut cx);
        assert_eq!(state.name(), "WaitingForResponseEntitySubscription");

        let state = step(state, Event::ResponseEntitySubscribed, &mut cx);
        let state = step(
            state,
            Event::ConnectionFailed(Error::Connection("reset".into())),
            &mut cx,
        );
        assert_eq!(state.name(), "WaitingForEndOfResponseEntity");

        // The broken connection is picked up when the entity completes.
        cx.connection_closed = true;
        let state = step(state, Event::ResponseEntityCompleted, &mut cx);
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn response_entity_failure_drops_the_connection() {
        let mut cx = TestContext::default();
        let (context, _handle) = request(Method::GET, 0);

        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        let state = step(state, Event::ResponseReceived(response()), &mut cx);
        let state = step(state, Event::ResponseDispatchable, &mut cx);
        let state = step(state, Event::ResponseEntitySubscribed, &mut cx);

        let state = step(
            state,
            Event::ResponseEntityFailed(Error::ResponseEntity("truncated".into())),
            &mut cx,
        );
        assert_eq!(state.name(), "Unconnected");
    }

    #[test]
    fn illegal_events_are_faults() {
        let mut cx = TestContext::default();

        let fault = SlotState::Unconnected
            .step(Event::ResponseReceived(response()), &mut cx)
            .unwrap_err();
        assert_eq!(fault.state, "Unconnected");
        assert_eq!(fault.event, "ResponseReceived");

        let fault = SlotState::Idle
            .step(Event::ResponseEntitySubscribed, &mut cx)
            .unwrap_err();
        assert_eq!(fault.state, "Idle");

        // A duplicate entity-completion signal has no home either.
        let (context, _handle) = request(Method::GET, 0);
        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::ConnectionAttemptSucceeded, &mut cx);
        let state = step(state, Event::RequestEntityCompleted, &mut cx);
        assert!(state
            .step(Event::RequestEntityCompleted, &mut cx)
            .is_err());
    }

    #[test]
    fn shutdown_is_a_noop_for_idle_slots_and_drops_busy_ones() {
        let mut cx = TestContext::default();

        let state = step(SlotState::Unconnected, Event::Shutdown, &mut cx);
        assert_eq!(state.name(), "Unconnected");
        let state = step(SlotState::Idle, Event::Shutdown, &mut cx);
        assert_eq!(state.name(), "Unconnected");

        let (context, _handle) = request(Method::GET, 0);
        let state = step(SlotState::Unconnected, Event::NewRequest(context), &mut cx);
        let state = step(state, Event::Shutdown, &mut cx);
        assert_eq!(state.name(), "Unconnected");
        // The request is dropped, not dispatched; the dispatcher settles
        // abandoned handles.
        assert!(cx.dispatched.is_empty());
    }

    #[test]
    fn only_the_subscription_state_carries_a_timeout() {
        assert!(SlotState::Unconnected.timeout().is_none());
        assert!(SlotState::Idle.timeout().is_none());
        assert!(SlotState::WaitingForEndOfRequestEntity.timeout().is_none());
    }
}
