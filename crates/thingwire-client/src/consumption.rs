//! Opting in and out of server-side streams with `START-SEND-*` / `STOP-SEND-*`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thingwire_core::{ControlFrame, CorrelationId, RequestError, StreamKind};
use tracing::{info, warn};

use crate::bus::CorrelationBus;

/// Query options appended to a start control frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumptionOptions {
    namespaces: Vec<String>,
    filter: Option<String>,
    extra_fields: Vec<String>,
}

impl ConsumptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    /// RQL expression the server evaluates per signal.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_extra_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    fn apply(&self, mut control: ControlFrame) -> ControlFrame {
        if !self.namespaces.is_empty() {
            control = control.with_param("namespaces", self.namespaces.join(","));
        }
        if let Some(filter) = &self.filter {
            control = control.with_param("filter", filter.as_str());
        }
        if !self.extra_fields.is_empty() {
            control = control.with_param("extra-fields", self.extra_fields.join(","));
        }
        control
    }
}

/// Groups of streams started and suspended together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumptionScope {
    Twin,
    /// Live events, live messages and live commands.
    Live,
    Policies,
}

impl ConsumptionScope {
    pub fn streams(self) -> &'static [StreamKind] {
        match self {
            Self::Twin => &[StreamKind::TwinEvents],
            Self::Live => &[StreamKind::LiveEvents, StreamKind::LiveMessages, StreamKind::LiveCommands],
            Self::Policies => &[StreamKind::PolicyAnnouncements],
        }
    }
}

/// Tracks which streams are on and keeps their start frames for reconnect replay.
pub struct ConsumptionManager {
    bus: Arc<CorrelationBus>,
    active: DashMap<StreamKind, ControlFrame>,
}

impl ConsumptionManager {
    pub fn new(bus: Arc<CorrelationBus>) -> Self {
        Self {
            bus,
            active: DashMap::new(),
        }
    }

    /// Start `kind` and wait for the server's acknowledgement. A repeated
    /// start replaces the earlier options. A rejected start is forgotten.
    pub async fn start(
        &self,
        kind: StreamKind,
        options: &ConsumptionOptions,
        timeout: Duration,
    ) -> Result<(), RequestError> {
        let control = options.apply(kind.start());
        self.bus.sink().retain_for_replay(kind.as_str(), control.to_string());
        let _ = self.active.insert(kind, control.clone());

        let outcome = match self.bus.send_control(&control, CorrelationId::new(), timeout) {
            Ok(handle) => handle.await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(_) => {
                info!(stream = %kind, control = %control, "consumption started");
                Ok(())
            }
            Err(error) => {
                warn!(stream = %kind, %error, "consumption start failed");
                if self.active.remove_if(&kind, |_, current| *current == control).is_some() {
                    self.bus.sink().release_replay(kind.as_str());
                }
                Err(error)
            }
        }
    }

    /// Stop `kind` and wait for the server's acknowledgement. Nothing is
    /// replayed for it after this call, even if the acknowledgement fails.
    pub async fn stop(&self, kind: StreamKind, timeout: Duration) -> Result<(), RequestError> {
        self.bus.sink().release_replay(kind.as_str());
        let _ = self.active.remove(&kind);
        self.bus
            .send_control(&kind.stop(), CorrelationId::new(), timeout)?
            .await?;
        info!(stream = %kind, "consumption stopped");
        Ok(())
    }

    pub async fn start_scope(
        &self,
        scope: ConsumptionScope,
        options: &ConsumptionOptions,
        timeout: Duration,
    ) -> Result<(), RequestError> {
        for kind in scope.streams() {
            self.start(*kind, options, timeout).await?;
        }
        Ok(())
    }

    pub async fn stop_scope(&self, scope: ConsumptionScope, timeout: Duration) -> Result<(), RequestError> {
        for kind in scope.streams() {
            self.stop(*kind, timeout).await?;
        }
        Ok(())
    }

    pub fn is_active(&self, kind: StreamKind) -> bool {
        self.active.contains_key(&kind)
    }

    pub fn active_streams(&self) -> Vec<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .filter(|kind| self.active.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveCommandDispatcher;
    use crate::testing::RecordingSink;
    use crate::worker::WorkerPool;
    use serde_json::json;
    use thingwire_core::Envelope;
    use thingwire_transport::FrameSink;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn manager() -> (Arc<ConsumptionManager>, Arc<CorrelationBus>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let bus = Arc::new(CorrelationBus::new(
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            Arc::new(LiveCommandDispatcher::new()),
            WorkerPool::default(),
        ));
        (Arc::new(ConsumptionManager::new(Arc::clone(&bus))), bus, sink)
    }

    async fn wait_for_controls(sink: &RecordingSink, count: usize) -> Vec<ControlFrame> {
        for _ in 0..200 {
            let controls = sink.controls();
            if controls.len() >= count {
                return controls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} control frames, got {:?}", sink.sent());
    }

    fn ack(literal: &str) -> Envelope {
        Envelope::Control(literal.parse().unwrap())
    }

    #[test]
    fn options_become_query_parameters() {
        let options = ConsumptionOptions::new()
            .with_namespaces(["org.acme", "org.other"])
            .with_filter("eq(attributes/room,\"kitchen\")")
            .with_extra_fields(["attributes"]);
        let control = options.apply(StreamKind::TwinEvents.start());
        assert_eq!(control.param("namespaces"), Some("org.acme,org.other"));
        assert_eq!(control.param("filter"), Some("eq(attributes/room,\"kitchen\")"));
        assert_eq!(control.param("extra-fields"), Some("attributes"));
    }

    #[test]
    fn live_scope_covers_three_streams() {
        assert_eq!(
            ConsumptionScope::Live.streams(),
            &[StreamKind::LiveEvents, StreamKind::LiveMessages, StreamKind::LiveCommands]
        );
    }

    #[tokio::test]
    async fn start_resolves_on_ack_and_is_replayed() {
        let (manager, bus, sink) = manager();
        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                let options = ConsumptionOptions::new().with_namespaces(["org.acme"]);
                manager.start(StreamKind::TwinEvents, &options, TIMEOUT).await
            }
        });

        let sent = wait_for_controls(&sink, 1).await;
        assert_eq!(sent[0].command(), "START-SEND-EVENTS");
        assert!(sent[0].param("correlation-id").is_some());
        assert_eq!(
            sink.replay().get("twin-events").map(String::as_str),
            Some("START-SEND-EVENTS?namespaces=org.acme")
        );

        bus.publish(ack("START-SEND-EVENTS:ACK"));
        starting.await.unwrap().unwrap();
        assert_eq!(manager.active_streams(), vec![StreamKind::TwinEvents]);
    }

    #[tokio::test]
    async fn error_response_fails_start_and_forgets_it() {
        let (manager, bus, sink) = manager();
        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                let options = ConsumptionOptions::new().with_filter("broken(");
                manager.start(StreamKind::LiveMessages, &options, TIMEOUT).await
            }
        });

        let sent = wait_for_controls(&sink, 1).await;
        let id = sent[0].param("correlation-id").unwrap().to_owned();
        bus.publish(Envelope::Signal(
            serde_json::from_value(json!({
                "topic": "_/_/things/twin/errors",
                "headers": {"correlation-id": id},
                "path": "/",
                "value": {"error": "rql.expression.invalid"},
                "status": 400
            }))
            .unwrap(),
        ));

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(RequestError::ErrorResponse { status: 400, .. })));
        assert!(!manager.is_active(StreamKind::LiveMessages));
        assert!(sink.replay().is_empty());
    }

    #[tokio::test]
    async fn stop_releases_replay_and_awaits_ack() {
        let (manager, bus, sink) = manager();
        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .start(StreamKind::PolicyAnnouncements, &ConsumptionOptions::new(), TIMEOUT)
                    .await
            }
        });
        wait_for_controls(&sink, 1).await;
        bus.publish(ack("START-SEND-POLICY-ANNOUNCEMENTS:ACK"));
        starting.await.unwrap().unwrap();

        let stopping = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.stop(StreamKind::PolicyAnnouncements, TIMEOUT).await }
        });
        let sent = wait_for_controls(&sink, 2).await;
        assert_eq!(sent[1].command(), "STOP-SEND-POLICY-ANNOUNCEMENTS");
        assert!(sink.replay().is_empty());

        bus.publish(ack("STOP-SEND-POLICY-ANNOUNCEMENTS:ACK"));
        stopping.await.unwrap().unwrap();
        assert!(manager.active_streams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_start_times_out() {
        let (manager, _bus, sink) = manager();
        let result = manager
            .start(StreamKind::LiveCommands, &ConsumptionOptions::new(), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
        assert!(sink.replay().is_empty());
    }
}
