use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "thingwire_transport" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from textual levels as found in settings files. Unknown level
    /// names fall back to INFO for the default and are dropped for modules.
    pub fn from_levels<'a>(
        level: &str,
        module_levels: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: module_levels
                .into_iter()
                .filter_map(|(module, level)| Some((module.to_owned(), level.parse().ok()?)))
                .collect(),
            json,
        }
    }

    fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Handle to the installed subscriber's filter.
pub struct TelemetryGuard {
    config: TelemetryConfig,
    filter: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&mut self, module: &str, level: Level) -> Result<(), TelemetryError> {
        match self.config.module_levels.iter_mut().find(|(m, _)| m == module) {
            Some(entry) => entry.1 = level,
            None => self.config.module_levels.push((module.to_string(), level)),
        }
        let directives = self.config.directives();
        self.filter.reload(EnvFilter::new(directives))?;
        Ok(())
    }

    /// Current per-module log level overrides.
    pub fn module_levels(&self) -> &[(String, Level)] {
        &self.config.module_levels
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_target(true).with_span_list(true));
    let text_layer = (!config.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    Ok(TelemetryGuard { config, filter })
}
