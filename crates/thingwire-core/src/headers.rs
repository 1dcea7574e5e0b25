use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::acks::AckLabel;
use crate::ids::CorrelationId;
use crate::topic::Channel;

pub const CORRELATION_ID: &str = "correlation-id";
pub const REQUESTED_ACKS: &str = "requested-acks";
pub const CHANNEL: &str = "channel";
pub const CONTENT_TYPE: &str = "content-type";

/// Case-insensitive frame headers. Keys are stored lowercased.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Headers(Map<String, Value>);

impl From<Map<String, Value>> for Headers {
    fn from(map: Map<String, Value>) -> Self {
        Self(
            map.into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value))
                .collect(),
        )
    }
}

impl From<Headers> for Map<String, Value> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&key.to_ascii_lowercase())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.get_str(CORRELATION_ID)
            .filter(|id| !id.is_empty())
            .map(CorrelationId::from_raw)
    }

    pub fn set_correlation_id(&mut self, id: &CorrelationId) {
        self.insert(CORRELATION_ID, id.as_str());
    }

    pub fn channel(&self) -> Option<Channel> {
        self.get_str(CHANNEL).and_then(Channel::parse)
    }

    /// Requested acknowledgement labels.
    ///
    /// Accepts a JSON array of strings or a comma-separated string. Labels
    /// that fail validation are skipped.
    pub fn requested_acks(&self) -> Vec<AckLabel> {
        let raw: Vec<&str> = match self.get(REQUESTED_ACKS) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(joined)) => joined.split(',').collect(),
            _ => return Vec::new(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .filter_map(|label| AckLabel::parse(label).ok())
            .collect()
    }

    pub fn has_requested_acks(&self) -> bool {
        self.contains(REQUESTED_ACKS)
    }

    pub fn set_requested_acks(&mut self, labels: &[AckLabel]) {
        let items = labels
            .iter()
            .map(|label| Value::String(label.as_str().to_owned()))
            .collect();
        self.insert(REQUESTED_ACKS, Value::Array(items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_case_insensitive() {
        let headers: Headers = serde_json::from_value(json!({"Correlation-Id": "abc"})).unwrap();
        assert_eq!(headers.correlation_id(), Some(CorrelationId::from_raw("abc")));
        assert!(headers.contains("CORRELATION-ID"));
    }

    #[test]
    fn requested_acks_from_array() {
        let headers: Headers =
            serde_json::from_value(json!({"requested-acks": ["live-response", "custom-ack"]})).unwrap();
        let labels: Vec<String> = headers.requested_acks().iter().map(|l| l.to_string()).collect();
        assert_eq!(labels, vec!["live-response", "custom-ack"]);
    }

    #[test]
    fn requested_acks_from_comma_string() {
        let headers: Headers =
            serde_json::from_value(json!({"requested-acks": "twin-persisted, search-persisted"})).unwrap();
        assert_eq!(headers.requested_acks().len(), 2);
    }

    #[test]
    fn invalid_labels_are_skipped() {
        let headers: Headers =
            serde_json::from_value(json!({"requested-acks": ["ok-label", "x", "bad label"]})).unwrap();
        let labels = headers.requested_acks();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].as_str(), "ok-label");
    }

    #[test]
    fn set_requested_acks_writes_array() {
        let mut headers = Headers::new();
        headers.set_requested_acks(&[AckLabel::live_response()]);
        assert_eq!(headers.get(REQUESTED_ACKS), Some(&json!(["live-response"])));
    }

    #[test]
    fn empty_correlation_id_is_absent() {
        let headers: Headers = serde_json::from_value(json!({"correlation-id": ""})).unwrap();
        assert!(headers.correlation_id().is_none());
    }
}
