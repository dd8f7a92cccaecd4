//! The dispatcher task.
//!
//! Owns every slot, routes incoming requests onto them (idle and connected
//! first, then a slot already dialing, then a cold slot), keeps the
//! warm-connection floor, applies the retry budget to failed requests, and
//! merges the slots' outputs back to the callers. All slot transitions run
//! on this task, so per-slot ordering is total.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::conn::{Connect, ConnectionEvent, OutgoingConnection};
use crate::error::Error;
use crate::request::{RequestContext, ResponseContext};
use crate::BoxError;

use super::slot::Slot;
use super::state::SlotState;
use super::Config;

/// Raw activity addressed to one slot, tagged with the connection
/// generation it belongs to.
#[derive(Debug)]
pub(crate) struct SlotMessage {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) payload: Payload,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Connected(OutgoingConnection),
    ConnectFailed(BoxError),
    Wire(ConnectionEvent),
    EntitySubscribed,
    EntityCompleted,
    EntityFailed(BoxError),
    Timeout { epoch: u64 },
    IdleExpired { epoch: u64 },
    LifetimeExpired,
}

pub(crate) struct Dispatcher {
    slots: Vec<Slot>,
    requests: mpsc::Receiver<RequestContext>,
    control: mpsc::Receiver<()>,
    control_closed: bool,
    events: mpsc::UnboundedReceiver<SlotMessage>,
    retries: VecDeque<RequestContext>,
    config: Arc<Config>,
    draining: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        connector: Arc<dyn Connect>,
        config: Arc<Config>,
        requests: mpsc::Receiver<RequestContext>,
        control: mpsc::Receiver<()>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let slots = (0..config.max_connections)
            .map(|index| Slot::new(index, config.clone(), connector.clone(), events_tx.clone()))
            .collect();
        Self {
            slots,
            requests,
            control,
            control_closed: false,
            events,
            retries: VecDeque::new(),
            config,
            draining: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.maintain();

            if self.draining && self.retries.is_empty() && self.all_idle() {
                self.shutdown_now();
                return;
            }

            // Backpressure: new requests are accepted only while a slot can
            // take them and no retry is waiting for one.
            let want_request =
                !self.draining && self.retries.is_empty() && self.route_target().is_some();

            tokio::select! {
                biased;
                command = self.control.recv(), if !self.control_closed => match command {
                    Some(()) => {
                        self.shutdown_now();
                        return;
                    }
                    None => self.control_closed = true,
                },
                Some(message) = self.events.recv() => self.on_message(message),
                request = self.requests.recv(), if want_request => match request {
                    Some(request) => self.route(request),
                    None => self.draining = true,
                },
            }
        }
    }

    fn maintain(&mut self) {
        for slot in &mut self.slots {
            if slot.is_faulted() {
                slot.reset();
            }
        }

        while !self.retries.is_empty() {
            let Some(index) = self.route_target() else {
                break;
            };
            let request = self.retries.pop_front().expect("retry queue is non-empty");
            trace!(slot = index, request = %request.info(), "routing queued request");
            self.slots[index].assign(request);
            self.drain(index);
        }

        if !self.draining && self.config.min_connections > 0 {
            let mut connected = self
                .slots
                .iter()
                .filter(|slot| slot.state().is_connected())
                .count();
            for index in 0..self.slots.len() {
                if connected >= self.config.min_connections {
                    break;
                }
                if matches!(self.slots[index].state(), SlotState::Unconnected) {
                    debug!(slot = index, "pre-connecting to maintain the warm floor");
                    self.slots[index].preconnect();
                    connected += 1;
                }
            }
        }
    }

    /// Pick the slot a new request should land on: an idle connection
    /// first, then a dial already in flight, then a cold slot.
    fn route_target(&self) -> Option<usize> {
        let mut dialing = None;
        let mut cold = None;
        for (index, slot) in self.slots.iter().enumerate() {
            match slot.state() {
                SlotState::Idle => return Some(index),
                SlotState::PreConnecting => {
                    if dialing.is_none() {
                        dialing = Some(index);
                    }
                }
                SlotState::Unconnected => {
                    if cold.is_none() {
                        cold = Some(index);
                    }
                }
                _ => {}
            }
        }
        dialing.or(cold)
    }

    fn route(&mut self, request: RequestContext) {
        match self.route_target() {
            Some(index) => {
                trace!(slot = index, request = %request.info(), "routing request");
                self.slots[index].assign(request);
                self.drain(index);
            }
            None => self.retries.push_back(request),
        }
    }

    fn on_message(&mut self, message: SlotMessage) {
        let index = message.slot;
        if let Some(slot) = self.slots.get_mut(index) {
            slot.on_message(message);
            self.drain(index);
        }
    }

    fn drain(&mut self, index: usize) {
        for response in self.slots[index].take_responses() {
            self.on_response(response);
        }
    }

    /// A slot reported a determined result: settle the caller's handle, or
    /// spend a retry and put the request back in line.
    fn on_response(&mut self, response: ResponseContext) {
        let ResponseContext {
            mut request,
            result,
        } = response;
        match result {
            Ok(response) => {
                trace!(request = %request.info(), status = %response.status(), "delivering response");
                request.promise.settle(Ok(response));
            }
            Err(cause) => {
                if request.can_be_retried() {
                    request.retries_left -= 1;
                    debug!(
                        request = %request.info(),
                        retries_left = request.retries_left,
                        %cause,
                        "re-enqueueing failed request"
                    );
                    self.retries.push_front(request);
                } else {
                    debug!(request = %request.info(), %cause, "delivering failure");
                    request.promise.settle(Err(cause));
                }
            }
        }
    }

    fn all_idle(&self) -> bool {
        self.slots.iter().all(|slot| slot.state().is_idle())
    }

    fn shutdown_now(&mut self) {
        debug!("pool shutting down");
        for slot in &mut self.slots {
            slot.shutdown();
        }
        for mut request in self.retries.drain(..) {
            request.promise.settle(Err(Error::Shutdown));
        }
        self.requests.close();
        while let Ok(mut request) = self.requests.try_recv() {
            request.promise.settle(Err(Error::Shutdown));
        }
    }
}
