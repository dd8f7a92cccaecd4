//! The slot runtime.
//!
//! Owns one optional connection, the current machine state, and the timers
//! attached to it. Raw activity (dial results, wire events, entity
//! monitor signals, timer expiries) arrives as [`SlotMessage`]s through the
//! dispatcher, is filtered against the slot's connection generation, and is
//! then translated into state-machine events. All transitions for one slot
//! happen on the dispatcher task, so they are totally ordered.
//!
//! Connection generations resolve the classic stale-event hazard: a late
//! signal from a connection the slot has already abandoned must never reach
//! the machine. Every message carries the generation it belongs to, and the
//! generation is bumped whenever the slot drops back to `Unconnected`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::body::{AbortSlot, Body, EntityMonitor};
use crate::conn::{self, Connect, ConnectionEvent, OutgoingConnection, ResponseHead};
use crate::error::Error;
use crate::request::{RequestContext, ResponseContext};

use super::dispatch::{Payload, SlotMessage};
use super::state::{Event, SlotContext, SlotState};
use super::Config;

pub(crate) struct Slot {
    index: usize,
    state: SlotState,
    connection: Option<OutgoingConnection>,
    conn_open: bool,
    /// The connection must not be reused once the in-flight exchange ends.
    close_after_exchange: bool,
    generation: u64,
    timer_epoch: u64,
    entity_abort: Option<AbortSlot>,
    faulted: bool,
    outbox: Vec<ResponseContext>,
    config: Arc<Config>,
    connector: Arc<dyn Connect>,
    events: mpsc::UnboundedSender<SlotMessage>,
}

impl Slot {
    pub(crate) fn new(
        index: usize,
        config: Arc<Config>,
        connector: Arc<dyn Connect>,
        events: mpsc::UnboundedSender<SlotMessage>,
    ) -> Self {
        Self {
            index,
            state: SlotState::Unconnected,
            connection: None,
            conn_open: false,
            close_after_exchange: false,
            generation: 0,
            timer_epoch: 0,
            entity_abort: None,
            faulted: false,
            outbox: Vec::new(),
            config,
            connector,
            events,
        }
    }

    pub(crate) fn state(&self) -> &SlotState {
        &self.state
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub(crate) fn assign(&mut self, request: RequestContext) {
        self.apply(Event::NewRequest(request));
    }

    pub(crate) fn preconnect(&mut self) {
        self.apply(Event::PreConnect);
    }

    pub(crate) fn shutdown(&mut self) {
        self.poison_entity(Error::Shutdown);
        self.apply(Event::Shutdown);
    }

    /// Replace a torn-down slot with a fresh one.
    pub(crate) fn reset(&mut self) {
        debug!(slot = self.index, "replacing faulted slot");
        self.drop_connection();
        self.state = SlotState::Unconnected;
        self.faulted = false;
    }

    /// Results dispatched since the last drain.
    pub(crate) fn take_responses(&mut self) -> Vec<ResponseContext> {
        std::mem::take(&mut self.outbox)
    }

    /// Deliver one raw message. Stale generations are dropped here, so the
    /// state machine never sees an event from an abandoned connection.
    pub(crate) fn on_message(&mut self, message: SlotMessage) {
        if message.generation != self.generation {
            trace!(
                slot = self.index,
                generation = message.generation,
                "dropping event from a previous connection"
            );
            return;
        }

        match message.payload {
            Payload::Connected(connection) => {
                debug_assert!(
                    self.connection.is_none(),
                    "connection attempt succeeded while a connection is owned"
                );
                self.connection = Some(connection);
                self.conn_open = true;
                self.arm_lifetime_timer();
                self.apply(Event::ConnectionAttemptSucceeded);
            }
            Payload::ConnectFailed(cause) => {
                self.apply(Event::ConnectionAttemptFailed(Error::Connect(cause)));
            }
            Payload::Wire(event) => self.on_wire_event(event),
            Payload::EntitySubscribed => self.apply(Event::ResponseEntitySubscribed),
            Payload::EntityCompleted => self.apply(Event::ResponseEntityCompleted),
            Payload::EntityFailed(cause) => {
                self.apply(Event::ResponseEntityFailed(Error::ResponseEntity(cause)));
            }
            Payload::Timeout { epoch } => {
                if epoch == self.timer_epoch {
                    self.poison_for_timeout();
                    self.apply(Event::Timeout);
                }
            }
            Payload::IdleExpired { epoch } => {
                if epoch == self.timer_epoch {
                    debug!(slot = self.index, "closing connection idle past its limit");
                    self.conn_open = false;
                    self.apply(Event::ConnectionCompleted);
                }
            }
            Payload::LifetimeExpired => {
                if matches!(self.state, SlotState::Idle) {
                    debug!(slot = self.index, "closing connection past its lifetime");
                    self.conn_open = false;
                    self.apply(Event::ConnectionCompleted);
                } else {
                    self.close_after_exchange = true;
                }
            }
        }
    }

    fn on_wire_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::RequestEntitySent => self.apply(Event::RequestEntityCompleted),
            ConnectionEvent::RequestEntityFailed(cause) => {
                // A half-sent request poisons the connection for reuse.
                self.conn_open = false;
                self.apply(Event::RequestEntityFailed(Error::RequestEntity(cause)));
            }
            ConnectionEvent::Response(response) => {
                self.apply(Event::ResponseReceived(response));
            }
            ConnectionEvent::Closed => {
                self.conn_open = false;
                self.apply(Event::ConnectionCompleted);
            }
            ConnectionEvent::Failed(cause) => {
                self.conn_open = false;
                self.apply(Event::ConnectionFailed(Error::Connection(cause)));
            }
        }
    }

    fn apply(&mut self, event: Event) {
        if self.faulted {
            return;
        }

        let state = std::mem::replace(&mut self.state, SlotState::Unconnected);
        let prev = state.name();
        match state.step(event, self) {
            Ok(next) => self.finish_transition(prev, next),
            Err(fault) => {
                error!(slot = self.index, %fault, "slot hit an illegal event, tearing down");
                self.poison_entity(Error::Shutdown);
                self.drop_connection();
                self.state = SlotState::Unconnected;
                self.faulted = true;
            }
        }
    }

    fn finish_transition(&mut self, prev: &'static str, next: SlotState) {
        let changed = prev != next.name();
        if changed {
            // Leaving a state cancels its timer.
            self.timer_epoch += 1;
            trace!(slot = self.index, from = prev, to = next.name(), "slot transition");
        }

        let mut deliver_dispatchable = false;
        let mut finish_request_entity = false;
        match &next {
            SlotState::Unconnected => self.drop_connection(),
            SlotState::Idle if changed => self.arm_idle_timer(),
            SlotState::WaitingForResponseDispatch { .. } if changed => {
                deliver_dispatchable = true;
            }
            SlotState::WaitingForResponseEntitySubscription { .. } if changed => {
                if let Some(timeout) = next.timeout() {
                    self.arm_state_timer(timeout);
                }
            }
            SlotState::WaitingForEndOfRequestEntity if changed && !self.conn_open => {
                // The driver died before the request entity finished, so
                // its completion signal is never coming.
                finish_request_entity = true;
            }
            _ => {}
        }

        self.state = next;

        if deliver_dispatchable {
            // The dispatcher's output port (promise settle or retry queue)
            // always has capacity, so readiness is immediate.
            self.apply(Event::ResponseDispatchable);
        } else if finish_request_entity {
            self.apply(Event::RequestEntityFailed(Error::RequestEntity(
                "connection closed before the request entity was fully sent".into(),
            )));
        }
    }

    fn drop_connection(&mut self) {
        if self.connection.take().is_some() {
            trace!(
                slot = self.index,
                generation = self.generation,
                "dropping connection"
            );
        }
        self.conn_open = false;
        self.close_after_exchange = false;
        self.entity_abort = None;
        self.generation += 1;
    }

    fn poison_entity(&mut self, cause: Error) {
        if let Some(abort) = &self.entity_abort {
            let mut cell = abort.lock();
            if cell.is_none() {
                *cell = Some(cause);
            }
        }
    }

    fn poison_for_timeout(&mut self) {
        if let SlotState::WaitingForResponseEntitySubscription {
            timeout: Some(timeout),
            ..
        } = &self.state
        {
            let timeout = *timeout;
            self.poison_entity(Error::SubscriptionTimeout(timeout));
        }
    }

    fn spawn_timer(&self, delay: Duration, payload: Payload) {
        let events = self.events.clone();
        let slot = self.index;
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SlotMessage {
                slot,
                generation,
                payload,
            });
        });
    }

    fn arm_state_timer(&self, timeout: Duration) {
        self.spawn_timer(
            timeout,
            Payload::Timeout {
                epoch: self.timer_epoch,
            },
        );
    }

    fn arm_idle_timer(&self) {
        if let Some(timeout) = self.config.idle_timeout {
            self.spawn_timer(
                timeout,
                Payload::IdleExpired {
                    epoch: self.timer_epoch,
                },
            );
        }
    }

    fn arm_lifetime_timer(&self) {
        if let Some(lifetime) = self.config.max_connection_lifetime {
            self.spawn_timer(lifetime, Payload::LifetimeExpired);
        }
    }
}

impl SlotContext for Slot {
    fn open_connection(&mut self) {
        debug_assert!(
            self.connection.is_none(),
            "dialing while a connection is owned"
        );
        trace!(
            slot = self.index,
            generation = self.generation,
            "opening connection"
        );
        let connector = self.connector.clone();
        let events = self.events.clone();
        let slot = self.index;
        let generation = self.generation;
        tokio::spawn(async move {
            match connector.connect().await {
                Ok((connection, stream)) => {
                    let connected = SlotMessage {
                        slot,
                        generation,
                        payload: Payload::Connected(connection),
                    };
                    if events.send(connected).is_err() {
                        return;
                    }
                    forward_wire_events(events, slot, generation, stream).await;
                }
                Err(cause) => {
                    let _ = events.send(SlotMessage {
                        slot,
                        generation,
                        payload: Payload::ConnectFailed(cause),
                    });
                }
            }
        });
    }

    fn push_request(&mut self, request: http::Request<Body>) {
        let Some(connection) = &self.connection else {
            debug_assert!(false, "pushing a request without a connection");
            return;
        };
        if let Err(cause) = connection.push(request) {
            // Surfaces as a connection failure on the next turn.
            let _ = self.events.send(SlotMessage {
                slot: self.index,
                generation: self.generation,
                payload: Payload::Wire(ConnectionEvent::Failed(cause)),
            });
        }
    }

    fn dispatch_response(&mut self, response: ResponseContext) {
        let response = match response {
            ResponseContext {
                request,
                result: Ok(inner),
            } => {
                let abort = AbortSlot::default();
                self.entity_abort = Some(abort.clone());
                let monitor =
                    EntityMonitor::new(self.events.clone(), self.index, self.generation, abort);
                ResponseContext {
                    request,
                    result: Ok(inner.map(|body| Body::monitored(body, monitor))),
                }
            }
            failed => failed,
        };
        self.outbox.push(response);
    }

    fn is_connection_closed(&self) -> bool {
        !self.conn_open
            || self
                .connection
                .as_ref()
                .map(|connection| connection.is_closed())
                .unwrap_or(true)
    }

    fn will_close_after(&self, response: &ResponseHead) -> bool {
        self.close_after_exchange || conn::will_close_after(response)
    }

    fn settings(&self) -> &Config {
        &self.config
    }
}

async fn forward_wire_events(
    events: mpsc::UnboundedSender<SlotMessage>,
    slot: usize,
    generation: u64,
    mut stream: mpsc::Receiver<ConnectionEvent>,
) {
    let mut terminal = false;
    while let Some(event) = stream.recv().await {
        if matches!(event, ConnectionEvent::Closed | ConnectionEvent::Failed(_)) {
            terminal = true;
        }
        let message = SlotMessage {
            slot,
            generation,
            payload: Payload::Wire(event),
        };
        if events.send(message).is_err() {
            return;
        }
    }
    // A driver that vanishes without a terminal event counts as a close.
    if !terminal {
        let _ = events.send(SlotMessage {
            slot,
            generation,
            payload: Payload::Wire(ConnectionEvent::Closed),
        });
    }
}
