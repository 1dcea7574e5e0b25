//! Settings type definitions.
//!
//! All types use camelCase field names in JSON and implement [`Default`];
//! `#[serde(default)]` lets a settings file name only the values it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings for a thingwire client.
///
/// ```json
/// {
///   "connection": { "endpoint": "wss://things.example.com/ws/2", "username": "ditto" },
///   "requests": { "timeoutMs": 10000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThingwireSettings {
    pub connection: ConnectionSettings,
    pub reconnect: ReconnectSettings,
    pub requests: RequestSettings,
    pub workers: WorkerSettings,
    pub logging: LoggingSettings,
}

/// Endpoint and credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// `ws://` or `wss://` URL of the WebSocket endpoint.
    pub endpoint: String,
    /// Basic auth user. Ignored when `token` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Retry transient failures instead of giving up.
    pub reconnect: bool,
    /// Upper bound for TCP connect plus WebSocket upgrade.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws/2".to_string(),
            username: None,
            password: None,
            token: None,
            reconnect: true,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Delay schedule between reconnect attempts.
///
/// `initialDelayMs: 0` retries immediately on every attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, 0.0 to 1.0.
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

/// Deadlines for correlated requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestSettings {
    pub timeout_ms: u64,
    pub acknowledgement_timeout_ms: u64,
    pub consumption_timeout_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            acknowledgement_timeout_ms: 60_000,
            consumption_timeout_ms: 10_000,
        }
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn acknowledgement_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledgement_timeout_ms)
    }

    pub fn consumption_timeout(&self) -> Duration {
        Duration::from_millis(self.consumption_timeout_ms)
    }
}

/// Handler worker pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// Maximum concurrently running handlers. `0` means unbounded.
    pub threads: usize,
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-target level overrides, e.g. `{"thingwire_transport": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ThingwireSettings::default();
        assert_eq!(settings.connection.endpoint, "ws://localhost:8080/ws/2");
        assert!(settings.connection.reconnect);
        assert_eq!(settings.requests.timeout(), Duration::from_secs(60));
        assert_eq!(settings.workers.threads, 0);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn camel_case_wire_names() {
        let value = serde_json::to_value(ThingwireSettings::default()).unwrap();
        assert_eq!(value["connection"]["connectTimeoutMs"], 10_000);
        assert_eq!(value["requests"]["acknowledgementTimeoutMs"], 60_000);
        assert!(value["connection"].get("username").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ThingwireSettings =
            serde_json::from_str(r#"{"reconnect": {"maxDelayMs": 5000}}"#).unwrap();
        assert_eq!(settings.reconnect.max_delay_ms, 5000);
        assert_eq!(settings.reconnect.initial_delay_ms, 100);
    }
}
