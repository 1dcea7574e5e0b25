//! The resilient connection: one lifecycle task per connection that connects,
//! pumps frames while up, and retries transient failures per the injected
//! [`ReconnectPolicy`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thingwire_core::{ConnectionError, Envelope};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::handshake::{self, WsStream};
use crate::policy::{Immediate, ReconnectPolicy};
use crate::state::ConnectionState;

/// Called once for every failed attempt, fatal or transient.
pub type ErrorHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// What the connection reports to its owner.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Inbound(Envelope),
    Connected,
    /// An established connection went away.
    Disconnected(ConnectionError),
    Closed,
}

#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    config: TransportConfig,
    policy: Arc<dyn ReconnectPolicy>,
    error_handler: Option<ErrorHandler>,
    state: watch::Sender<ConnectionState>,
    failure: Mutex<Option<ConnectionError>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    replay: DashMap<String, String>,
    running: AtomicBool,
    closed: AtomicBool,
    /// Bumped before every transition to `Connected`.
    connects: AtomicU64,
    cancel: CancellationToken,
}

enum Exit {
    Cancelled,
    Failed(ConnectionError),
}

enum PumpExit {
    Cancelled,
    Dropped(ConnectionError),
}

impl Connection {
    /// Connection with immediate reconnects and no error handler.
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::with_options(config, Arc::new(Immediate), None)
    }

    pub fn with_options(
        config: TransportConfig,
        policy: Arc<dyn ReconnectPolicy>,
        error_handler: Option<ErrorHandler>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            policy,
            error_handler,
            state,
            failure: Mutex::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events,
            replay: DashMap::new(),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Start the lifecycle if it is not running and wait until the
    /// connection is up, fails fatally, or is closed.
    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        let mut state = self.shared.state.subscribe();
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let connects = self.shared.connects.load(Ordering::SeqCst);
        Arc::clone(&self.shared).start();

        loop {
            // The watch keeps only the latest state, so a connection that came
            // up and dropped again is only visible through the counter.
            if self.shared.connects.load(Ordering::SeqCst) != connects {
                return Ok(());
            }
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                _ if !self.shared.running.load(Ordering::SeqCst) => {
                    if let Some(err) = self.shared.failure.lock().clone() {
                        return Err(err);
                    }
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Queue a text frame. Frames queued while disconnected go out after the
    /// next successful connect.
    pub fn send(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.shared
            .outbound_tx
            .send(text)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Re-send `text` first thing after every (re)connect until released.
    pub fn register_replay(&self, key: &str, text: String) {
        let _ = self.shared.replay.insert(key.to_owned(), text);
    }

    pub fn unregister_replay(&self, key: &str) {
        let _ = self.shared.replay.remove(key);
    }

    /// Stop for good: cancel any attempt in progress, end the reconnect loop,
    /// and fail waiting initializers with [`ConnectionError::Closed`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();
        let _ = self.shared.state.send_replace(ConnectionState::Closed);
        self.shared.emit(TransportEvent::Closed);
        info!(endpoint = %self.shared.config.endpoint, "connection closed");
    }
}

impl Shared {
    fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.failure.lock() = None;
        tokio::spawn(self.run());
    }

    async fn run(self: Arc<Self>) {
        let Some(mut outbound) = self.outbound_rx.lock().take() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let mut attempt: u32 = 0;
        let mut connected = false;
        let exit = loop {
            self.set_state(ConnectionState::Connecting);
            let opened = tokio::select! {
                () = self.cancel.cancelled() => break Exit::Cancelled,
                opened = handshake::open(&self.config, |phase| self.set_state(phase)) => opened,
            };

            let err = match opened {
                Ok(ws) => {
                    attempt = 0;
                    connected = true;
                    let _ = self.connects.fetch_add(1, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %self.config.endpoint, "connected");
                    self.emit(TransportEvent::Connected);
                    match self.pump(ws, &mut outbound).await {
                        PumpExit::Cancelled => break Exit::Cancelled,
                        PumpExit::Dropped(err) => {
                            self.emit(TransportEvent::Disconnected(err.clone()));
                            err
                        }
                    }
                }
                Err(err) => err,
            };

            self.report(&err);
            if err.is_fatal() || !self.config.reconnect {
                break Exit::Failed(err);
            }

            attempt = attempt.saturating_add(1);
            let delay = self.policy.delay(attempt);
            self.set_state(ConnectionState::Reconnecting);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                () = self.cancel.cancelled() => break Exit::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        };

        *self.outbound_rx.lock() = Some(outbound);
        if let Exit::Failed(err) = exit {
            // A drop after a successful connect is reported through events,
            // not to the next initializer.
            if err.is_fatal() || !connected {
                *self.failure.lock() = Some(err);
            }
            self.running.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn pump(&self, ws: WsStream, outbound: &mut mpsc::UnboundedReceiver<String>) -> PumpExit {
        let (mut sink, mut stream) = ws.split();

        let replay: Vec<String> = self.replay.iter().map(|entry| entry.value().clone()).collect();
        for text in replay {
            trace!(frame = %text, "replaying");
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                return PumpExit::Dropped(ConnectionError::ConnectionDropped(e.to_string()));
            }
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::Cancelled;
                }
                next = outbound.recv() => {
                    let Some(text) = next else { return PumpExit::Cancelled };
                    trace!(frame = %text, "outbound");
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return PumpExit::Dropped(ConnectionError::ConnectionDropped(e.to_string()));
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.forward(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by peer: {} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by peer".to_owned());
                        return PumpExit::Dropped(ConnectionError::ConnectionDropped(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return PumpExit::Dropped(ConnectionError::ConnectionDropped(e.to_string()));
                    }
                    None => {
                        return PumpExit::Dropped(ConnectionError::ConnectionDropped("stream ended".into()));
                    }
                }
            }
        }
    }

    fn forward(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => {
                trace!(frame = %envelope, "inbound");
                self.emit(TransportEvent::Inbound(envelope));
            }
            Err(error) => warn!(%error, "dropping unparseable inbound frame"),
        }
    }

    fn report(&self, err: &ConnectionError) {
        if err.is_fatal() {
            error!(endpoint = %self.config.endpoint, kind = err.error_kind(), error = %err, "connection failed");
        } else {
            warn!(endpoint = %self.config.endpoint, kind = err.error_kind(), error = %err, "connection attempt failed");
        }
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }

    /// Publish `next` unless the connection has been closed.
    fn set_state(&self, next: ConnectionState) {
        let _ = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails() {
        let (connection, _events) = Connection::new(TransportConfig::new("ws://127.0.0.1:9/ws"));
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.send("x".into()), Err(ConnectionError::Closed));
    }

    #[tokio::test]
    async fn initialize_after_close_fails() {
        let (connection, _events) = Connection::new(TransportConfig::new("ws://127.0.0.1:9/ws"));
        connection.close();
        assert_eq!(connection.initialize().await, Err(ConnectionError::Closed));
    }

    #[tokio::test]
    async fn close_emits_closed_once() {
        let (connection, mut events) = Connection::new(TransportConfig::new("ws://127.0.0.1:9/ws"));
        connection.close();
        connection.close();
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_endpoint_is_fatal() {
        let (connection, _events) = Connection::new(TransportConfig::new("http://localhost/ws"));
        let result = connection.initialize().await;
        assert!(matches!(result, Err(ConnectionError::InvalidEndpoint(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn sends_queue_before_connect() {
        let (connection, _events) = Connection::new(TransportConfig::new("ws://127.0.0.1:9/ws"));
        assert!(connection.send("queued".into()).is_ok());
    }
}
