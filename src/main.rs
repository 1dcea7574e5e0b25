//! # thingwire
//!
//! Connects to a thing service, starts the requested streams and logs every
//! signal that arrives until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use thingwire_client::{Client, ClientConfig, ConsumptionOptions, ConsumptionScope, GlobalHandlers};
use thingwire_core::{status, RegistrationId, Selector};
use thingwire_telemetry::{init_telemetry, TelemetryConfig};

/// Thing service monitor.
#[derive(Parser, Debug)]
#[command(name = "thingwire", about = "Stream signals from a thing service")]
struct Cli {
    /// Settings file (defaults to `~/.thingwire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// WebSocket endpoint (overrides settings).
    #[arg(long)]
    endpoint: Option<String>,

    /// Streams to consume. Repeatable.
    #[arg(long = "consume", value_enum, default_values_t = [Scope::Twin])]
    scopes: Vec<Scope>,

    /// Only receive signals of these namespaces. Repeatable.
    #[arg(long = "namespace")]
    namespaces: Vec<String>,

    /// RQL filter evaluated by the server.
    #[arg(long)]
    filter: Option<String>,

    /// Answer live commands nothing else handles with `501 Not Implemented`.
    #[arg(long, default_value_t = false)]
    reject_live_commands: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scope {
    Twin,
    Live,
    Policies,
}

impl From<Scope> for ConsumptionScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Twin => Self::Twin,
            Scope::Live => Self::Live,
            Scope::Policies => Self::Policies,
        }
    }
}

impl Cli {
    fn consumption_options(&self) -> ConsumptionOptions {
        let mut options = ConsumptionOptions::new().with_namespaces(self.namespaces.iter().cloned());
        if let Some(filter) = &self.filter {
            options = options.with_filter(filter.clone());
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(thingwire_settings::settings_path);
    let mut settings = thingwire_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    if let Some(endpoint) = &args.endpoint {
        settings.connection.endpoint = endpoint.clone();
    }

    let logging = &settings.logging;
    let _telemetry = init_telemetry(TelemetryConfig::from_levels(
        &logging.level,
        logging
            .module_levels
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        logging.json,
    ))
    .context("Failed to initialize logging")?;

    let client = Client::new(ClientConfig::from_settings(&settings));
    client.register(RegistrationId::new(), Selector::compile("/**"), |signal| {
        let frame = signal.frame();
        tracing::info!(
            topic = %frame.topic(),
            path = frame.path(),
            value = %frame.value().cloned().unwrap_or_default(),
            "signal"
        );
    });
    if args.reject_live_commands {
        client.set_global_handlers(GlobalHandlers::new().on_any(|command| {
            match command.respond(status::NOT_IMPLEMENTED, None) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(%error, "failed to answer live command");
                    false
                }
            }
        }));
    }

    let mut states = client.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(%state, "connection state");
        }
    });

    client
        .initialize()
        .await
        .with_context(|| format!("Failed to connect to {}", settings.connection.endpoint))?;

    let options = args.consumption_options();
    for scope in &args.scopes {
        client
            .start_consumption((*scope).into(), &options)
            .await
            .with_context(|| format!("Failed to start {scope:?} consumption"))?;
    }
    tracing::info!(streams = ?client.active_streams(), "consuming");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    client.close();
    tracing::info!("Shutdown complete");
    Ok(())
}
