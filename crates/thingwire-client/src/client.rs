use std::sync::Arc;
use std::time::Duration;

use thingwire_core::{
    AckLabel, ConfigError, ConnectionError, Frame, RegistrationId, RequestError, Selector, StreamKind, ThingId,
};
use thingwire_settings::ThingwireSettings;
use thingwire_transport::{
    Connection, ConnectionState, Credentials, ErrorHandler, ExponentialBackoff, FrameSink, Immediate,
    ReconnectPolicy, TransportConfig, TransportEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::acks::{AcknowledgementHandle, AcknowledgementRequest};
use crate::bus::{CorrelationBus, SignalHandler};
use crate::consumption::{ConsumptionManager, ConsumptionOptions, ConsumptionScope};
use crate::live::{EntityHandleLookup, FeatureHandleLookup, GlobalHandlers, Handle, LiveCommandDispatcher, LiveHandles};
use crate::pending::ResponseHandle;
use crate::signal::{LiveCommand, Signal};
use crate::worker::WorkerPool;

/// Everything a [`Client`] needs before it can connect.
#[derive(Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub reconnect_policy: Arc<dyn ReconnectPolicy>,
    pub error_handler: Option<ErrorHandler>,
    pub request_timeout: Duration,
    pub acknowledgement_timeout: Duration,
    pub consumption_timeout: Duration,
    /// 0 leaves handler concurrency unbounded.
    pub worker_threads: usize,
}

impl ClientConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            reconnect_policy: Arc::new(Immediate),
            error_handler: None,
            request_timeout: Duration::from_secs(60),
            acknowledgement_timeout: Duration::from_secs(60),
            consumption_timeout: Duration::from_secs(10),
            worker_threads: 0,
        }
    }

    pub fn from_settings(settings: &ThingwireSettings) -> Self {
        let connection = &settings.connection;
        let credentials = match (&connection.token, &connection.username) {
            (Some(token), _) => Credentials::bearer(token.clone()),
            (None, Some(username)) => {
                Credentials::basic(username.clone(), connection.password.clone().unwrap_or_default())
            }
            (None, None) => Credentials::None,
        };
        let transport = TransportConfig::new(connection.endpoint.clone())
            .with_credentials(credentials)
            .with_reconnect(connection.reconnect)
            .with_connect_timeout(connection.connect_timeout());

        let reconnect = &settings.reconnect;
        let reconnect_policy: Arc<dyn ReconnectPolicy> = if reconnect.initial_delay_ms == 0 {
            Arc::new(Immediate)
        } else {
            Arc::new(ExponentialBackoff {
                base_delay: Duration::from_millis(reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(reconnect.max_delay_ms),
                jitter_factor: reconnect.jitter_factor,
            })
        };

        Self {
            transport,
            reconnect_policy,
            error_handler: None,
            request_timeout: settings.requests.timeout(),
            acknowledgement_timeout: settings.requests.acknowledgement_timeout(),
            consumption_timeout: settings.requests.consumption_timeout(),
            worker_threads: settings.workers.threads,
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_acknowledgement_timeout(mut self, timeout: Duration) -> Self {
        self.acknowledgement_timeout = timeout;
        self
    }

    pub fn with_consumption_timeout(mut self, timeout: Duration) -> Self {
        self.consumption_timeout = timeout;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }
}

/// One connection to a thing service, with request correlation, stream
/// consumption, subscriptions and live command handling on top.
pub struct Client {
    connection: Connection,
    bus: Arc<CorrelationBus>,
    consumption: ConsumptionManager,
    handles: Arc<LiveHandles>,
    request_timeout: Duration,
    acknowledgement_timeout: Duration,
    consumption_timeout: Duration,
    dispatch: JoinHandle<()>,
}

impl Client {
    /// Build the client and spawn its dispatch task. Nothing connects until
    /// [`Client::initialize`]. Must run inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let (connection, events) =
            Connection::with_options(config.transport, config.reconnect_policy, config.error_handler);
        let dispatcher = Arc::new(LiveCommandDispatcher::new());
        let handles = LiveHandles::new();
        dispatcher.set_feature_handle_lookup(handles.feature_lookup());
        dispatcher.set_entity_handle_lookup(handles.entity_lookup());

        let sink: Arc<dyn FrameSink> = Arc::new(connection.clone());
        let bus = Arc::new(CorrelationBus::new(
            sink,
            dispatcher,
            WorkerPool::new(config.worker_threads),
        ));
        let dispatch = tokio::spawn(dispatch_events(Arc::clone(&bus), events));

        Self {
            connection,
            consumption: ConsumptionManager::new(Arc::clone(&bus)),
            bus,
            handles,
            request_timeout: config.request_timeout,
            acknowledgement_timeout: config.acknowledgement_timeout,
            consumption_timeout: config.consumption_timeout,
            dispatch,
        }
    }

    pub fn from_settings(settings: &ThingwireSettings) -> Self {
        Self::new(ClientConfig::from_settings(settings))
    }

    // ── Lifecycle ──

    /// Connect and wait until connected, failed fatally, or closed.
    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.connection.initialize().await
    }

    /// Close for good. Everything in flight fails with connection loss.
    pub fn close(&self) {
        self.connection.close();
        self.bus.fail_outstanding();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    // ── Subscriptions ──

    pub fn register<F>(&self, id: RegistrationId, selector: Selector, handler: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(handler);
        self.bus.register(id, selector, handler);
    }

    pub fn unregister(&self, id: &RegistrationId) -> bool {
        self.bus.unregister(id)
    }

    /// Thing and feature messages with `subject`, or with any subject.
    pub fn register_for_message<F>(&self, id: RegistrationId, subject: Option<&str>, handler: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.register(id, Selector::message_subject(subject), handler);
    }

    /// Changes of `thing`, or of every thing.
    pub fn register_for_changes<F>(&self, id: RegistrationId, thing: Option<&ThingId>, handler: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.register(id, Selector::thing_changes(thing), handler);
    }

    pub fn register_for_feature_changes<F>(
        &self,
        id: RegistrationId,
        thing: Option<&ThingId>,
        feature: Option<&str>,
        handler: F,
    ) where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.register(id, Selector::feature_changes(thing, feature), handler);
    }

    // ── Requests ──

    /// Send a request and wait for its response within the configured timeout.
    /// Frames declaring acknowledgements besides the channel's terminal
    /// label must go through [`Client::send_with_acknowledgements`].
    pub fn send(&self, frame: Frame) -> Result<ResponseHandle<Frame>, RequestError> {
        self.send_with_timeout(frame, self.request_timeout)
    }

    pub fn send_with_timeout(&self, frame: Frame, timeout: Duration) -> Result<ResponseHandle<Frame>, RequestError> {
        if let Some(channel) = frame.topic().channel() {
            let terminal = channel.terminal_label();
            if frame.requested_acks().iter().any(|label| *label != terminal) {
                return Err(ConfigError::AcknowledgementsRequireAggregation { terminal }.into());
            }
        }
        self.bus.send(frame, timeout)
    }

    /// Send `frame` requesting `labels` and wait for all of them. The labels
    /// must include the terminal label of the frame's channel; otherwise
    /// nothing is sent.
    pub fn send_with_acknowledgements(
        &self,
        frame: Frame,
        labels: impl IntoIterator<Item = AckLabel>,
    ) -> Result<AcknowledgementHandle, RequestError> {
        let channel = frame
            .topic()
            .channel()
            .ok_or_else(|| ConfigError::MissingChannel(frame.topic().to_string()))?;
        let request = AcknowledgementRequest::new(channel, labels)?;
        self.bus
            .send_with_acknowledgements(frame, &request, self.acknowledgement_timeout)
    }

    /// Send without waiting for anything, e.g. an event or a live message.
    pub fn emit(&self, frame: Frame) -> Result<(), RequestError> {
        self.bus.emit(frame)
    }

    // ── Consumption ──

    pub async fn start_consumption(
        &self,
        scope: ConsumptionScope,
        options: &ConsumptionOptions,
    ) -> Result<(), RequestError> {
        self.consumption
            .start_scope(scope, options, self.consumption_timeout)
            .await
    }

    pub async fn suspend_consumption(&self, scope: ConsumptionScope) -> Result<(), RequestError> {
        self.consumption.stop_scope(scope, self.consumption_timeout).await
    }

    pub async fn start_stream(&self, kind: StreamKind, options: &ConsumptionOptions) -> Result<(), RequestError> {
        self.consumption.start(kind, options, self.consumption_timeout).await
    }

    pub async fn stop_stream(&self, kind: StreamKind) -> Result<(), RequestError> {
        self.consumption.stop(kind, self.consumption_timeout).await
    }

    pub fn active_streams(&self) -> Vec<StreamKind> {
        self.consumption.active_streams()
    }

    // ── Live commands ──

    /// Handle live commands addressed to `thing`.
    pub fn handle_thing_commands<F>(&self, thing: ThingId, processor: F)
    where
        F: Fn(&LiveCommand) -> bool + Send + Sync + 'static,
    {
        self.handles.set_thing(thing, Handle::live(processor));
    }

    /// Handle live commands addressed to one feature of `thing`.
    pub fn handle_feature_commands<F>(&self, thing: ThingId, feature: impl Into<String>, processor: F)
    where
        F: Fn(&LiveCommand) -> bool + Send + Sync + 'static,
    {
        self.handles.set_feature(thing, feature, Handle::live(processor));
    }

    pub fn stop_handling_thing_commands(&self, thing: &ThingId) -> bool {
        self.handles.remove_thing(thing)
    }

    pub fn stop_handling_feature_commands(&self, thing: &ThingId, feature: &str) -> bool {
        self.handles.remove_feature(thing, feature)
    }

    /// Replace the built-in feature handle store with an external lookup.
    pub fn set_feature_handle_lookup(&self, lookup: FeatureHandleLookup) {
        self.bus.dispatcher().set_feature_handle_lookup(lookup);
    }

    /// Replace the built-in thing handle store with an external lookup.
    pub fn set_entity_handle_lookup(&self, lookup: EntityHandleLookup) {
        self.bus.dispatcher().set_entity_handle_lookup(lookup);
    }

    pub fn set_global_handlers(&self, handlers: GlobalHandlers) {
        self.bus.dispatcher().set_global_handlers(handlers);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close();
        self.dispatch.abort();
    }
}

async fn dispatch_events(bus: Arc<CorrelationBus>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Inbound(envelope) => {
                let _ = bus.publish(envelope);
            }
            TransportEvent::Connected => debug!("transport connected"),
            TransportEvent::Disconnected(error) => {
                info!(%error, "transport disconnected");
                bus.fail_outstanding();
            }
            TransportEvent::Closed => {
                bus.fail_outstanding();
                break;
            }
        }
    }
}
