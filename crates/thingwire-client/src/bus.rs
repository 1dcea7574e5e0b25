//! The correlation bus: every inbound envelope ends up in exactly one place.
//!
//! Terminal responses go to the request that is waiting for them, frames of
//! an acknowledgement set go to the aggregator, live commands go to the
//! dispatcher, and everything else fans out to matching subscriptions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thingwire_core::status::OK;
use thingwire_core::{
    ControlFrame, CorrelationId, Envelope, Frame, RegistrationId, RequestError, Selector,
};
use thingwire_transport::{send_envelope, FrameSink, SendError};
use tracing::{debug, trace, warn};

use crate::acks::{AcknowledgementAggregator, AcknowledgementHandle, AcknowledgementRequest};
use crate::claims::ClaimSet;
use crate::live::LiveCommandDispatcher;
use crate::pending::{PendingRequests, ResponseHandle};
use crate::signal::{LiveCommand, Signal};
use crate::worker::WorkerPool;

pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

struct Subscription {
    selector: Selector,
    handler: SignalHandler,
}

/// Where `publish` delivered an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Completed a pending request or stream control.
    Resolved,
    /// Recorded by an acknowledgement set.
    Acknowledged,
    /// Handed to the live command dispatcher.
    Dispatched,
    /// Submitted to this many subscriptions.
    FannedOut(usize),
    Unroutable,
}

pub struct CorrelationBus {
    sink: Arc<dyn FrameSink>,
    subscriptions: DashMap<RegistrationId, Arc<Subscription>>,
    requests: Arc<PendingRequests<Frame>>,
    controls: Arc<PendingRequests<ControlFrame>>,
    control_acks: DashMap<String, CorrelationId>,
    acks: Arc<AcknowledgementAggregator>,
    dispatcher: Arc<LiveCommandDispatcher>,
    workers: WorkerPool,
}

impl CorrelationBus {
    pub fn new(sink: Arc<dyn FrameSink>, dispatcher: Arc<LiveCommandDispatcher>, workers: WorkerPool) -> Self {
        let claims = Arc::new(ClaimSet::new());
        Self {
            sink,
            subscriptions: DashMap::new(),
            requests: PendingRequests::new(Arc::clone(&claims)),
            controls: PendingRequests::new(Arc::clone(&claims)),
            control_acks: DashMap::new(),
            acks: AcknowledgementAggregator::new(claims),
            dispatcher,
            workers,
        }
    }

    pub fn dispatcher(&self) -> &Arc<LiveCommandDispatcher> {
        &self.dispatcher
    }

    pub fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }

    // ── Subscriptions ──

    /// Install `handler` under `id`, replacing whatever was there.
    pub fn register(&self, id: RegistrationId, selector: Selector, handler: SignalHandler) {
        debug!(registration = %id, selector = %selector, "registering subscription");
        let subscription = Arc::new(Subscription { selector, handler });
        if self.subscriptions.insert(id.clone(), subscription).is_some() {
            debug!(registration = %id, "replaced existing subscription");
        }
    }

    /// Returns whether anything was registered under `id`.
    pub fn unregister(&self, id: &RegistrationId) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Outbound ──

    /// Send `frame` and wait for its terminal response. A correlation id is
    /// generated when the frame has none.
    pub fn send(&self, frame: Frame, timeout: Duration) -> Result<ResponseHandle<Frame>, RequestError> {
        let id = frame.correlation_id().unwrap_or_default();
        let frame = frame.with_correlation_id(&id);
        let handle = self.requests.register(id.clone(), frame.topic().to_string(), timeout)?;
        if let Err(error) = self.put(Envelope::Signal(frame)) {
            let _ = self.requests.discard(&id);
            return Err(error);
        }
        Ok(handle)
    }

    /// Send `frame` declaring `request`'s labels and collect the acknowledgements.
    pub fn send_with_acknowledgements(
        &self,
        frame: Frame,
        request: &AcknowledgementRequest,
        timeout: Duration,
    ) -> Result<AcknowledgementHandle, RequestError> {
        let id = frame.correlation_id().unwrap_or_default();
        let frame = frame
            .with_correlation_id(&id)
            .with_requested_acks(request.labels());
        let handle = self.acks.await_acknowledgements(id.clone(), request, timeout)?;
        if let Err(error) = self.put(Envelope::Signal(frame)) {
            let _ = self.acks.discard(&id);
            return Err(error);
        }
        Ok(handle)
    }

    /// Fire and forget.
    pub fn emit(&self, frame: Frame) -> Result<(), RequestError> {
        self.put(Envelope::Signal(frame))
    }

    /// Send `control` with `id` attached and wait for its `:ACK`.
    pub fn send_control(
        &self,
        control: &ControlFrame,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<ResponseHandle<ControlFrame>, RequestError> {
        let handle = self.controls.register(id.clone(), control.command(), timeout)?;
        if let Some(previous) = self.control_acks.insert(control.command().to_owned(), id.clone()) {
            debug!(command = control.command(), previous = %previous, "superseding pending control");
        }
        let wire = control.clone().with_param("correlation-id", id.as_str());
        if let Err(error) = self.put(Envelope::Control(wire)) {
            let _ = self.control_acks.remove_if(control.command(), |_, pending| *pending == id);
            let _ = self.controls.discard(&id);
            return Err(error);
        }
        Ok(handle)
    }

    fn put(&self, envelope: Envelope) -> Result<(), RequestError> {
        trace!(frame = %envelope, "sending");
        send_envelope(self.sink.as_ref(), &envelope).map_err(|error| match error {
            SendError::Encode(e) => RequestError::Encode(e),
            SendError::Connection(e) => RequestError::Send(e),
        })
    }

    // ── Inbound ──

    pub fn publish(&self, envelope: Envelope) -> Delivery {
        match envelope {
            Envelope::Control(control) => self.publish_control(control),
            Envelope::Signal(frame) => self.publish_signal(frame),
        }
    }

    fn publish_control(&self, control: ControlFrame) -> Delivery {
        if !control.is_ack() {
            warn!(command = control.command(), "unroutable control frame");
            return Delivery::Unroutable;
        }
        let Some((_, id)) = self.control_acks.remove(control.command()) else {
            debug!(command = control.command(), "control acknowledged without a waiter");
            return Delivery::Unroutable;
        };
        if self.controls.resolve(&id, control) {
            Delivery::Resolved
        } else {
            Delivery::Unroutable
        }
    }

    fn publish_signal(&self, frame: Frame) -> Delivery {
        if let Some(id) = frame.correlation_id() {
            if self.acks.contains(&id) {
                let recorded = if frame.is_acknowledgement() {
                    self.acks.record_frame(&id, &frame)
                } else if frame.is_terminal() {
                    self.acks.record_terminal(&id, &frame)
                } else {
                    false
                };
                if recorded {
                    return Delivery::Acknowledged;
                }
            }
            if frame.is_terminal() && !frame.is_acknowledgement() {
                if let Some(delivery) = self.complete_request(&id, frame.clone()) {
                    return delivery;
                }
            }
        }

        if frame.is_terminal() || frame.is_acknowledgement() {
            warn!(
                topic = %frame.topic(),
                status = ?frame.status(),
                correlation_id = ?frame.correlation_id(),
                "unroutable response"
            );
            return Delivery::Unroutable;
        }

        if frame.is_command() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let command = LiveCommand::new(frame, Arc::clone(&self.sink));
            self.workers.submit("live-command", move || {
                let _ = dispatcher.dispatch(&command);
            });
            return Delivery::Dispatched;
        }

        self.fan_out(frame)
    }

    fn complete_request(&self, id: &CorrelationId, frame: Frame) -> Option<Delivery> {
        let status = frame.status().unwrap_or(OK);
        if self.requests.contains(id) {
            let completed = if frame.is_error() {
                self.requests.fail(
                    id,
                    RequestError::ErrorResponse {
                        status,
                        frame: Box::new(frame),
                    },
                )
            } else {
                self.requests.resolve(id, frame)
            };
            return completed.then_some(Delivery::Resolved);
        }
        if self.controls.contains(id) && frame.is_error() {
            self.control_acks.retain(|_, pending| *pending != *id);
            let failed = self.controls.fail(
                id,
                RequestError::ErrorResponse {
                    status,
                    frame: Box::new(frame),
                },
            );
            return failed.then_some(Delivery::Resolved);
        }
        None
    }

    fn fan_out(&self, frame: Frame) -> Delivery {
        let address = frame.address();
        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().selector.matches(&address))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if matching.is_empty() {
            debug!(address = %address, topic = %frame.topic(), "no subscription for signal");
            return Delivery::Unroutable;
        }

        let count = matching.len();
        for subscription in matching {
            let signal = Signal::new(frame.clone(), Arc::clone(&self.sink));
            self.workers.submit("subscription", move || (subscription.handler)(signal));
        }
        Delivery::FannedOut(count)
    }

    // ── Lifecycle ──

    /// Fail everything in flight with connection loss.
    pub fn fail_outstanding(&self) {
        let requests = self.requests.fail_all(|id| RequestError::ConnectionLost(id.clone()));
        let controls = self.controls.fail_all(|id| RequestError::ConnectionLost(id.clone()));
        let acks = self.acks.fail_all();
        self.control_acks.clear();
        if requests + controls + acks > 0 {
            debug!(requests, controls, acks, "failed outstanding work after connection loss");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len() + self.controls.len() + self.acks.len()
    }
}
