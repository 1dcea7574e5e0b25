//! Inbound signals as handed to subscription handlers and live processors.

use std::sync::Arc;

use serde_json::Value;
use thingwire_core::headers::REQUESTED_ACKS;
use thingwire_core::{AckLabel, Acknowledgement, Channel, Criterion, Envelope, Frame, Headers};
use thingwire_transport::{send_envelope, FrameSink, SendError};
use tracing::debug;

/// An event, message or announcement delivered to a subscription, with a
/// way to answer the acknowledgements it requests.
#[derive(Clone)]
pub struct Signal {
    frame: Frame,
    sink: Arc<dyn FrameSink>,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("frame", &self.frame).finish_non_exhaustive()
    }
}

impl Signal {
    pub fn new(frame: Frame, sink: Arc<dyn FrameSink>) -> Self {
        Self { frame, sink }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    pub fn value(&self) -> Option<&Value> {
        self.frame.value()
    }

    pub fn requested_acks(&self) -> Vec<AckLabel> {
        self.frame.requested_acks()
    }

    /// Send the acknowledgement for `label` back to the peer. Returns false,
    /// sending nothing, when the signal names no thing or carries no
    /// correlation id, as policy announcements do.
    pub fn acknowledge(&self, label: &AckLabel, status: u16, payload: Option<Value>) -> Result<bool, SendError> {
        if !self.requested_acks().contains(label) {
            debug!(label = %label, topic = %self.frame.topic(), "acknowledging a label that was not requested");
        }
        let Some(thing) = self.frame.thing_id() else {
            debug!(topic = %self.frame.topic(), "signal has no thing to acknowledge for");
            return Ok(false);
        };
        let Some(correlation_id) = self.frame.correlation_id() else {
            debug!(topic = %self.frame.topic(), "signal has no correlation id to acknowledge");
            return Ok(false);
        };
        let channel = self.frame.topic().channel().unwrap_or(Channel::Twin);
        let mut ack = Acknowledgement::new(label.clone(), Some(thing.clone()), status);
        if let Some(payload) = payload {
            ack = ack.with_payload(payload);
        }
        self.send(ack.to_frame(&thing, channel, &correlation_id))?;
        Ok(true)
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), SendError> {
        send_envelope(self.sink.as_ref(), &Envelope::Signal(frame))
    }
}

/// A live command awaiting a local answer.
#[derive(Clone, Debug)]
pub struct LiveCommand {
    signal: Signal,
}

impl LiveCommand {
    pub fn new(frame: Frame, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            signal: Signal::new(frame, sink),
        }
    }

    pub fn frame(&self) -> &Frame {
        self.signal.frame()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Send the terminal response: same topic, path and correlation id.
    pub fn respond(&self, status: u16, value: Option<Value>) -> Result<(), SendError> {
        let command = self.frame();
        let mut response = Frame::new(command.topic().clone(), command.path())
            .with_headers(self.echoed_headers())
            .with_status(status);
        if let Some(value) = value {
            response = response.with_value(value);
        }
        self.signal.send(response)
    }

    /// Emit the event that reports this command as applied. Retrievals have
    /// no event; returns false for them.
    pub fn emit_event(&self, value: Option<Value>) -> Result<bool, SendError> {
        let command = self.frame();
        let Some(action) = command.topic().command_action().and_then(|a| a.event_action()) else {
            return Ok(false);
        };
        let topic = command
            .topic()
            .with_criterion(Criterion::Events, Some(action.to_owned()));
        let mut event = Frame::new(topic, command.path()).with_headers(self.echoed_headers());
        if let Some(value) = value.or_else(|| command.value().cloned()) {
            event = event.with_value(value);
        }
        self.signal.send(event)?;
        Ok(true)
    }

    pub fn acknowledge(&self, label: &AckLabel, status: u16, payload: Option<Value>) -> Result<bool, SendError> {
        self.signal.acknowledge(label, status, payload)
    }

    pub fn requested_acks(&self) -> Vec<AckLabel> {
        self.signal.requested_acks()
    }

    /// The command's headers minus its acknowledgement request, which
    /// concerns the command only.
    fn echoed_headers(&self) -> Headers {
        let mut headers = self.frame().headers().clone();
        let _ = headers.remove(REQUESTED_ACKS);
        headers
    }
}
