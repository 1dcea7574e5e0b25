//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ThingwireSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `THINGWIRE_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ThingwireSettings;

/// Resolve the path to the settings file (`~/.thingwire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".thingwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ThingwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ThingwireSettings> {
    let defaults = serde_json::to_value(ThingwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ThingwireSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides.
pub fn apply_env_overrides(settings: &mut ThingwireSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut ThingwireSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("THINGWIRE_ENDPOINT") {
        settings.connection.endpoint = v;
    }
    if let Some(v) = env.string("THINGWIRE_USERNAME") {
        settings.connection.username = Some(v);
    }
    if let Some(v) = env.string("THINGWIRE_PASSWORD") {
        settings.connection.password = Some(v);
    }
    if let Some(v) = env.string("THINGWIRE_TOKEN") {
        settings.connection.token = Some(v);
    }
    if let Some(v) = env.bool("THINGWIRE_RECONNECT") {
        settings.connection.reconnect = v;
    }
    if let Some(v) = env.u64("THINGWIRE_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.connection.connect_timeout_ms = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = env.u64("THINGWIRE_RECONNECT_INITIAL_DELAY_MS", 0, 600_000) {
        settings.reconnect.initial_delay_ms = v;
    }
    if let Some(v) = env.u64("THINGWIRE_RECONNECT_MAX_DELAY_MS", 0, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }

    // ── Requests ────────────────────────────────────────────────────
    if let Some(v) = env.u64("THINGWIRE_REQUEST_TIMEOUT_MS", 1, 3_600_000) {
        settings.requests.timeout_ms = v;
    }
    if let Some(v) = env.u64("THINGWIRE_ACK_TIMEOUT_MS", 1, 3_600_000) {
        settings.requests.acknowledgement_timeout_ms = v;
    }

    // ── Workers & logging ───────────────────────────────────────────
    if let Some(v) = env.usize("THINGWIRE_WORKER_THREADS", 0, 4096) {
        settings.workers.threads = v;
    }
    if let Some(v) = env.string("THINGWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("THINGWIRE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"connection": {"endpoint": "ws://a", "reconnect": true}});
        let source = serde_json::json!({"connection": {"endpoint": "ws://b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["connection"]["endpoint"], "ws://b");
        assert_eq!(merged["connection"]["reconnect"], true);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let merged = deep_merge(target, serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let merged = deep_merge(target, serde_json::json!({"items": [4]}));
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.requests.timeout_ms, 60_000);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"connection": {"endpoint": "wss://things.example.com/ws/2", "username": "ditto"},
                "workers": {"threads": 4}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.connection.endpoint, "wss://things.example.com/ws/2");
        assert_eq!(settings.connection.username.as_deref(), Some("ditto"));
        assert_eq!(settings.workers.threads, 4);
        assert!(settings.connection.reconnect);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::Json(_))));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_over_file_values() {
        let mut settings = ThingwireSettings::default();
        let lookup = lookup_from(&[
            ("THINGWIRE_ENDPOINT", "ws://10.0.0.5:8080/ws/2"),
            ("THINGWIRE_RECONNECT", "off"),
            ("THINGWIRE_REQUEST_TIMEOUT_MS", "2500"),
            ("THINGWIRE_WORKER_THREADS", "8"),
        ]);
        apply_overrides(&mut settings, &lookup);
        assert_eq!(settings.connection.endpoint, "ws://10.0.0.5:8080/ws/2");
        assert!(!settings.connection.reconnect);
        assert_eq!(settings.requests.timeout_ms, 2500);
        assert_eq!(settings.workers.threads, 8);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut settings = ThingwireSettings::default();
        let lookup = lookup_from(&[
            ("THINGWIRE_RECONNECT", "maybe"),
            ("THINGWIRE_REQUEST_TIMEOUT_MS", "0"),
            ("THINGWIRE_ENDPOINT", ""),
        ]);
        apply_overrides(&mut settings, &lookup);
        assert!(settings.connection.reconnect);
        assert_eq!(settings.requests.timeout_ms, 60_000);
        assert_eq!(settings.connection.endpoint, "ws://localhost:8080/ws/2");
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn parse_range_bounds() {
        assert_eq!(parse_u64_range("10", 1, 10), Some(10));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_usize_range("-1", 0, 10), None);
    }
}
