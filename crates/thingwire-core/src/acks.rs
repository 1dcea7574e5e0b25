use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::errors::{ConfigError, FrameError};
use crate::frame::Frame;
use crate::headers::Headers;
use crate::ids::{CorrelationId, ThingId};
use crate::status;
use crate::topic::{Channel, Criterion, TopicPath};

const LIVE_RESPONSE: &str = "live-response";
const TWIN_PERSISTED: &str = "twin-persisted";

/// A validated acknowledgement label: 3 to 165 characters of `[a-zA-Z0-9-_:]`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AckLabel(String);

impl AckLabel {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let valid_len = (3..=165).contains(&raw.len());
        let valid_chars = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'));
        if valid_len && valid_chars {
            Ok(Self(raw.to_owned()))
        } else {
            Err(ConfigError::InvalidLabel(raw.to_owned()))
        }
    }

    pub fn live_response() -> Self {
        Self(LIVE_RESPONSE.to_owned())
    }

    pub fn twin_persisted() -> Self {
        Self(TWIN_PERSISTED.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AckLabel {
    type Error = ConfigError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<AckLabel> for String {
    fn from(label: AckLabel) -> Self {
        label.0
    }
}

impl fmt::Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named acknowledgement of a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Acknowledgement {
    label: AckLabel,
    entity_id: Option<ThingId>,
    status: u16,
    headers: Headers,
    payload: Option<Value>,
}

impl Acknowledgement {
    pub fn new(label: AckLabel, entity_id: Option<ThingId>, status: u16) -> Self {
        Self {
            label,
            entity_id,
            status,
            headers: Headers::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn label(&self) -> &AckLabel {
        &self.label
    }

    pub fn entity_id(&self) -> Option<&ThingId> {
        self.entity_id.as_ref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }

    /// Treat a terminal response frame as the acknowledgement for `label`.
    pub fn from_terminal(label: AckLabel, frame: &Frame) -> Self {
        Self {
            label,
            entity_id: frame.thing_id(),
            status: frame.status().unwrap_or(status::OK),
            headers: frame.headers().clone(),
            payload: frame.value().cloned(),
        }
    }

    /// Acknowledgements carried by an `acks` frame.
    ///
    /// A frame whose topic names a label holds one acknowledgement. A frame
    /// without a label holds an aggregate object keyed by label.
    pub fn from_frame(frame: &Frame) -> Result<Vec<Self>, FrameError> {
        let topic = frame.topic();
        if topic.criterion() != Criterion::Acks {
            return Ok(Vec::new());
        }
        let entity_id = frame.thing_id();

        if let Some(label) = topic.action() {
            let label = AckLabel::parse(label)
                .map_err(|_| FrameError::InvalidAcknowledgement(format!("label `{label}`")))?;
            return Ok(vec![Self {
                label,
                entity_id,
                status: frame.status().unwrap_or(status::OK),
                headers: frame.headers().clone(),
                payload: frame.value().cloned(),
            }]);
        }

        let Some(Value::Object(entries)) = frame.value() else {
            return Err(FrameError::InvalidAcknowledgement("aggregate value must be an object".into()));
        };
        entries
            .iter()
            .map(|(label, entry)| Self::from_aggregate_entry(label, entry, entity_id.clone()))
            .collect()
    }

    fn from_aggregate_entry(label: &str, entry: &Value, entity_id: Option<ThingId>) -> Result<Self, FrameError> {
        let label = AckLabel::parse(label)
            .map_err(|_| FrameError::InvalidAcknowledgement(format!("label `{label}`")))?;
        let status = entry
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .ok_or_else(|| FrameError::InvalidAcknowledgement(format!("`{label}` has no status")))?;
        let headers = match entry.get("headers") {
            Some(Value::Object(map)) => Headers::from(map.clone()),
            _ => Headers::new(),
        };
        let payload = entry.get("payload").or_else(|| entry.get("value")).cloned();
        Ok(Self {
            label,
            entity_id,
            status,
            headers,
            payload,
        })
    }

    /// Build the outbound frame that sends this acknowledgement back to the peer.
    pub fn to_frame(&self, thing: &ThingId, channel: Channel, correlation_id: &CorrelationId) -> Frame {
        let topic = TopicPath::new(
            thing,
            crate::topic::Group::Things,
            Some(channel),
            Criterion::Acks,
            Some(self.label.to_string()),
        );
        let mut frame = Frame::new(topic, "/")
            .with_status(self.status)
            .with_correlation_id(correlation_id);
        if let Some(payload) = &self.payload {
            frame = frame.with_value(payload.clone());
        }
        frame
    }

    /// Aggregate wire representation, `{"status", "headers", "payload"}`.
    pub fn to_aggregate_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("status".into(), json!(self.status));
        if !self.headers.is_empty() {
            entry.insert("headers".into(), Value::Object(self.headers.clone().into()));
        }
        if let Some(payload) = &self.payload {
            entry.insert("payload".into(), payload.clone());
        }
        Value::Object(entry)
    }
}
