use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::acks::AckLabel;
use crate::control::ControlFrame;
use crate::errors::FrameError;
use crate::headers::Headers;
use crate::ids::{CorrelationId, ThingId};
use crate::selector::Address;
use crate::status;
use crate::topic::{Criterion, Group, TopicPath};

fn root_path() -> String {
    "/".to_owned()
}

/// A protocol signal: `{"topic","headers","path","value","status"}`.
///
/// Frames are values. The `with_*` builders consume and return a new frame
/// rather than mutating one that may already be shared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    topic: TopicPath,
    #[serde(default)]
    headers: Headers,
    #[serde(default = "root_path")]
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

impl Frame {
    pub fn new(topic: TopicPath, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            topic,
            headers: Headers::new(),
            path: if path.is_empty() { root_path() } else { path },
            value: None,
            status: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_correlation_id(mut self, id: &CorrelationId) -> Self {
        self.headers.set_correlation_id(id);
        self
    }

    pub fn with_requested_acks(mut self, labels: &[AckLabel]) -> Self {
        self.headers.set_requested_acks(labels);
        self
    }

    pub fn topic(&self) -> &TopicPath {
        &self.topic
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers.correlation_id()
    }

    pub fn requested_acks(&self) -> Vec<AckLabel> {
        self.headers.requested_acks()
    }

    pub fn thing_id(&self) -> Option<ThingId> {
        match self.topic.group() {
            Group::Things => Some(self.topic.thing_id()),
            Group::Policies => None,
        }
    }

    /// Feature id when the payload path points below `/features/{id}`.
    pub fn feature_id(&self) -> Option<&str> {
        let mut segments = self.path.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some("features"), Some(feature)) => Some(feature),
            _ => None,
        }
    }

    /// Carries a status and therefore ends a request.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_some_and(status::is_error)
    }

    pub fn is_command(&self) -> bool {
        self.topic.criterion() == Criterion::Commands
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.topic.criterion() == Criterion::Acks
    }

    pub fn address(&self) -> Address {
        Address::of(&self.topic, &self.path)
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::MalformedJson(e.to_string()))
    }
}

/// One inbound or outbound unit of text on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Signal(Frame),
    Control(ControlFrame),
}

impl Envelope {
    /// JSON objects are signals; anything else is a plain-text control frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            serde_json::from_str(trimmed)
                .map(Self::Signal)
                .map_err(|e| FrameError::MalformedJson(e.to_string()))
        } else {
            trimmed.parse().map(Self::Control)
        }
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        match self {
            Self::Signal(frame) => frame.to_json(),
            Self::Control(control) => Ok(control.to_string()),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(frame) => write!(f, "{}{}", frame.topic(), frame.path()),
            Self::Control(control) => write!(f, "{control}"),
        }
    }
}
