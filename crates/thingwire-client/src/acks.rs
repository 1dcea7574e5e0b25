//! Acknowledgement aggregation: one request, N named acknowledgements,
//! one combined outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use thingwire_core::status::{self, FAILED_DEPENDENCY};
use thingwire_core::{
    AckLabel, Acknowledgement, AcknowledgementError, Channel, ConfigError, CorrelationId, Criterion, Frame,
    RequestError,
};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::claims::ClaimSet;

/// Validated set of labels a request asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcknowledgementRequest {
    channel: Channel,
    labels: Vec<AckLabel>,
    terminal: AckLabel,
}

impl AcknowledgementRequest {
    /// Fails unless `labels` is non-empty and contains the channel's
    /// terminal label. Duplicates are dropped, order is kept.
    pub fn new(channel: Channel, labels: impl IntoIterator<Item = AckLabel>) -> Result<Self, ConfigError> {
        let mut unique: Vec<AckLabel> = Vec::new();
        for label in labels {
            if !unique.contains(&label) {
                unique.push(label);
            }
        }
        if unique.is_empty() {
            return Err(ConfigError::NoAcknowledgementsRequested);
        }
        let terminal = channel.terminal_label();
        if !unique.contains(&terminal) {
            return Err(ConfigError::MissingTerminalLabel { expected: terminal });
        }
        Ok(Self {
            channel,
            labels: unique,
            terminal,
        })
    }

    pub fn parse<'a>(channel: Channel, labels: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let labels = labels
            .into_iter()
            .map(AckLabel::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(channel, labels)
    }

    /// Labels declared in the frame's `requested-acks` header.
    pub fn for_frame(frame: &Frame) -> Result<Self, ConfigError> {
        let channel = frame
            .topic()
            .channel()
            .ok_or_else(|| ConfigError::MissingChannel(frame.topic().to_string()))?;
        Self::new(channel, frame.requested_acks())
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn labels(&self) -> &[AckLabel] {
        &self.labels
    }

    pub fn terminal(&self) -> &AckLabel {
        &self.terminal
    }
}

/// Every requested acknowledgement arrived and succeeded.
#[derive(Clone, Debug)]
pub struct AggregateOutcome {
    status: u16,
    terminal: AckLabel,
    acknowledgements: Vec<Acknowledgement>,
}

impl AggregateOutcome {
    /// The single acknowledgement's status when one label was requested, else 200.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// In request order.
    pub fn acknowledgements(&self) -> &[Acknowledgement] {
        &self.acknowledgements
    }

    pub fn get(&self, label: &str) -> Option<&Acknowledgement> {
        self.acknowledgements.iter().find(|ack| ack.label().as_str() == label)
    }

    /// The acknowledgement standing for the actual response.
    pub fn terminal(&self) -> Option<&Acknowledgement> {
        self.get(self.terminal.as_str())
    }
}

type Outcome = Result<AggregateOutcome, AcknowledgementError>;

struct AckSet {
    requested: Vec<AckLabel>,
    terminal: AckLabel,
    received: HashMap<AckLabel, Acknowledgement>,
    tx: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
    started: Instant,
}

impl AckSet {
    fn is_complete(&self) -> bool {
        self.received.len() == self.requested.len()
    }

    fn finish(mut self, id: &CorrelationId) {
        let mut received = Vec::with_capacity(self.received.len());
        let mut missing = Vec::new();
        for label in &self.requested {
            match self.received.remove(label) {
                Some(ack) => received.push(ack),
                None => missing.push(label.clone()),
            }
        }

        let outcome = if missing.is_empty() && received.iter().all(Acknowledgement::is_success) {
            let status = match received.as_slice() {
                [only] => only.status(),
                _ => status::OK,
            };
            Ok(AggregateOutcome {
                status,
                terminal: self.terminal,
                acknowledgements: received,
            })
        } else {
            // A lone terminal acknowledgement speaks for the whole request.
            let status = match (self.requested.len(), received.as_slice()) {
                (1, [only]) => only.status(),
                _ => FAILED_DEPENDENCY,
            };
            Err(AcknowledgementError::DependencyFailed {
                status,
                received,
                missing,
            })
        };

        debug!(
            correlation_id = %id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "acknowledgements aggregated"
        );
        let _ = self.tx.send(outcome);
    }
}

/// Acknowledgement sets in flight, keyed by correlation id.
pub struct AcknowledgementAggregator {
    sets: DashMap<CorrelationId, AckSet>,
    claims: Arc<ClaimSet>,
}

impl AcknowledgementAggregator {
    pub fn new(claims: Arc<ClaimSet>) -> Arc<Self> {
        Arc::new(Self {
            sets: DashMap::new(),
            claims,
        })
    }

    /// Start collecting acknowledgements for `id`. Must run inside a tokio runtime.
    pub fn await_acknowledgements(
        self: &Arc<Self>,
        id: CorrelationId,
        request: &AcknowledgementRequest,
        timeout: Duration,
    ) -> Result<AcknowledgementHandle, RequestError> {
        if !self.claims.claim(&id) {
            return Err(RequestError::DuplicateCorrelationId(id));
        }
        let (tx, rx) = oneshot::channel();
        let _ = self.sets.insert(
            id.clone(),
            AckSet {
                requested: request.labels().to_vec(),
                terminal: request.terminal().clone(),
                received: HashMap::new(),
                tx,
                timer: None,
                started: Instant::now(),
            },
        );
        let timer = tokio::spawn(expire(Arc::downgrade(self), id.clone(), timeout)).abort_handle();
        match self.sets.get_mut(&id) {
            Some(mut set) => set.timer = Some(timer),
            None => timer.abort(),
        }
        Ok(AcknowledgementHandle { id, rx })
    }

    /// Record one acknowledgement. Labels that were not requested are
    /// ignored; a repeated label overwrites the earlier one. Returns false
    /// when no set exists for `id`.
    pub fn record(&self, id: &CorrelationId, ack: Acknowledgement) -> bool {
        let complete = {
            let Some(mut set) = self.sets.get_mut(id) else {
                return false;
            };
            if !set.requested.contains(ack.label()) {
                debug!(correlation_id = %id, label = %ack.label(), "ignoring unrequested acknowledgement");
                return true;
            }
            let _ = set.received.insert(ack.label().clone(), ack);
            set.is_complete()
        };
        if complete {
            if let Some(set) = self.take(id) {
                set.finish(id);
            }
        }
        true
    }

    /// Record every acknowledgement carried by an `acks` frame.
    pub fn record_frame(&self, id: &CorrelationId, frame: &Frame) -> bool {
        match Acknowledgement::from_frame(frame) {
            Ok(acks) => {
                // Entries after the one completing the set land nowhere, but
                // the frame still belonged to it.
                let known = self.contains(id);
                for ack in acks {
                    let _ = self.record(id, ack);
                }
                known
            }
            Err(error) => {
                warn!(correlation_id = %id, %error, "dropping malformed acknowledgement frame");
                self.contains(id)
            }
        }
    }

    /// Record a terminal response as the set's terminal acknowledgement.
    /// An `errors` frame ends the set at once, since no further
    /// acknowledgements will follow it.
    pub fn record_terminal(&self, id: &CorrelationId, frame: &Frame) -> bool {
        let Some(label) = self.sets.get(id).map(|set| set.terminal.clone()) else {
            return false;
        };
        let recorded = self.record(id, Acknowledgement::from_terminal(label, frame));
        if frame.topic().criterion() == Criterion::Errors {
            if let Some(set) = self.take(id) {
                set.finish(id);
            }
        }
        recorded
    }

    /// Fail every set with [`AcknowledgementError::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.sets.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(set) = self.take(&id) {
                let _ = set.tx.send(Err(AcknowledgementError::ConnectionLost(id)));
                failed += 1;
            }
        }
        failed
    }

    /// Drop the set without notifying its handle.
    pub fn discard(&self, id: &CorrelationId) -> bool {
        self.take(id).is_some()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.sets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn take(&self, id: &CorrelationId) -> Option<AckSet> {
        let (_, set) = self.sets.remove(id)?;
        if let Some(timer) = &set.timer {
            timer.abort();
        }
        self.claims.release(id);
        Some(set)
    }
}

async fn expire(aggregator: Weak<AcknowledgementAggregator>, id: CorrelationId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(aggregator) = aggregator.upgrade() else {
        return;
    };
    if let Some(set) = aggregator.take(&id) {
        warn!(
            correlation_id = %id,
            received = set.received.len(),
            requested = set.requested.len(),
            timeout_ms = timeout.as_millis() as u64,
            "acknowledgements timed out"
        );
        set.finish(&id);
    }
}

/// Completes with the aggregate outcome.
#[derive(Debug)]
pub struct AcknowledgementHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
}

impl AcknowledgementHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for AcknowledgementHandle {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AcknowledgementError::ConnectionLost(this.id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use thingwire_core::ThingId;

    fn label(raw: &str) -> AckLabel {
        AckLabel::parse(raw).unwrap()
    }

    fn ack(raw: &str, status: u16) -> Acknowledgement {
        Acknowledgement::new(label(raw), Some(ThingId::new("org.acme", "lamp")), status)
    }

    fn aggregator() -> Arc<AcknowledgementAggregator> {
        AcknowledgementAggregator::new(Arc::new(ClaimSet::new()))
    }

    // ── Request validation ──

    #[test]
    fn request_requires_terminal_label() {
        let err = AcknowledgementRequest::parse(Channel::Live, ["custom"]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingTerminalLabel {
                expected: AckLabel::live_response()
            }
        );
        let err = AcknowledgementRequest::parse(Channel::Twin, ["live-response"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTerminalLabel { expected } if expected.as_str() == "twin-persisted"));
    }

    #[test]
    fn request_rejects_empty_and_invalid_labels() {
        assert_eq!(
            AcknowledgementRequest::parse(Channel::Live, []).unwrap_err(),
            ConfigError::NoAcknowledgementsRequested
        );
        assert!(matches!(
            AcknowledgementRequest::parse(Channel::Live, ["live-response", "no spaces"]),
            Err(ConfigError::InvalidLabel(_))
        ));
    }

    #[test]
    fn request_deduplicates_in_order() {
        let request =
            AcknowledgementRequest::parse(Channel::Live, ["custom", "live-response", "custom"]).unwrap();
        let labels: Vec<&str> = request.labels().iter().map(AckLabel::as_str).collect();
        assert_eq!(labels, ["custom", "live-response"]);
        assert_eq!(request.terminal().as_str(), "live-response");
    }

    // ── Aggregation ──

    #[tokio::test]
    async fn only_terminal_label_carries_its_status() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-1");
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        assert!(acks.record(&id, ack("live-response", 201).with_payload(json!({"on": true}))));
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status(), 201);
        assert_eq!(outcome.terminal().unwrap().payload(), Some(&json!({"on": true})));
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn all_successful_yields_ok_status() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-2");
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        acks.record(&id, ack("custom", 204));
        acks.record(&id, ack("live-response", 201));
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status(), 200);
        assert_eq!(outcome.acknowledgements().len(), 2);
        assert_eq!(outcome.get("custom").unwrap().status(), 204);
    }

    #[tokio::test]
    async fn one_failure_fails_dependency_with_all_statuses() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-3");
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        acks.record(&id, ack("live-response", 200));
        acks.record(&id, ack("custom", 418));
        let err = handle.await.unwrap_err();
        match &err {
            AcknowledgementError::DependencyFailed {
                status,
                received,
                missing,
            } => {
                assert_eq!(*status, 424);
                assert_eq!(received.len(), 2);
                assert!(missing.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.acknowledgement("live-response").unwrap().status(), 200);
        assert_eq!(err.acknowledgement("custom").unwrap().status(), 418);
    }

    #[tokio::test]
    async fn duplicates_overwrite_and_unrequested_are_ignored() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-4");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        acks.record(&id, ack("custom", 500));
        acks.record(&id, ack("custom", 200));
        acks.record(&id, ack("stranger", 500));
        assert!(acks.contains(&id));
        acks.record(&id, ack("twin-persisted", 204));
        assert_eq!(handle.await.unwrap().get("custom").unwrap().status(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_missing_labels() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-5");
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_millis(100)).unwrap();
        acks.record(&id, ack("live-response", 200));

        match handle.await.unwrap_err() {
            AcknowledgementError::DependencyFailed { received, missing, .. } => {
                assert_eq!(received.len(), 1);
                assert_eq!(missing, vec![label("custom")]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!acks.record(&id, ack("custom", 200)));
    }

    #[tokio::test]
    async fn terminal_frame_counts_as_terminal_label() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-6");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        let frame: Frame = serde_json::from_str(
            r#"{"topic":"org.acme/lamp/things/twin/commands/modify","headers":{"correlation-id":"c-6"},
                "path":"/features/light","status":204}"#,
        )
        .unwrap();
        assert!(acks.record_terminal(&id, &frame));
        assert_eq!(handle.await.unwrap().status(), 204);
    }

    #[tokio::test]
    async fn failed_lone_terminal_keeps_its_status() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-6b");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        acks.record(&id, ack("twin-persisted", 404));
        match handle.await.unwrap_err() {
            AcknowledgementError::DependencyFailed { status, received, missing } => {
                assert_eq!(status, 404);
                assert_eq!(received.len(), 1);
                assert!(missing.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_terminal_among_others_is_failed_dependency() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-6c");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        acks.record(&id, ack("custom", 200));
        acks.record(&id, ack("twin-persisted", 404));
        assert!(matches!(
            handle.await,
            Err(AcknowledgementError::DependencyFailed { status: 424, .. })
        ));
    }

    #[tokio::test]
    async fn aggregate_frame_with_trailing_extra_label_is_consumed() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-6d");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        let frame: Frame = serde_json::from_value(json!({
            "topic": "org.acme/lamp/things/twin/acks",
            "headers": {"correlation-id": "c-6d"},
            "path": "/",
            "value": {
                "custom": {"status": 200},
                "twin-persisted": {"status": 204},
                "zz-extra": {"status": 200}
            }
        }))
        .unwrap();
        assert!(acks.record_frame(&id, &frame));
        assert_eq!(handle.await.unwrap().status(), 200);
        assert!(!acks.record_frame(&id, &frame));
    }

    #[tokio::test]
    async fn error_frame_ends_the_set_immediately() {
        let acks = aggregator();
        let id = CorrelationId::from_raw("c-7");
        let request = AcknowledgementRequest::parse(Channel::Twin, ["twin-persisted", "custom"]).unwrap();
        let handle = acks.await_acknowledgements(id.clone(), &request, Duration::from_secs(60)).unwrap();

        let frame: Frame = serde_json::from_str(
            r#"{"topic":"org.acme/lamp/things/twin/errors","headers":{"correlation-id":"c-7"},"path":"/","status":403}"#,
        )
        .unwrap();
        assert!(acks.record_terminal(&id, &frame));
        match handle.await.unwrap_err() {
            AcknowledgementError::DependencyFailed { received, missing, .. } => {
                assert_eq!(received[0].status(), 403);
                assert_eq!(missing, vec![label("custom")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_loss_fails_every_set() {
        let acks = aggregator();
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response"]).unwrap();
        let handle = acks
            .await_acknowledgements(CorrelationId::from_raw("c-8"), &request, Duration::from_secs(60))
            .unwrap();
        assert_eq!(acks.fail_all(), 1);
        assert!(matches!(handle.await, Err(AcknowledgementError::ConnectionLost(id)) if id.as_str() == "c-8"));
    }

    #[tokio::test]
    async fn claim_is_shared_with_pending_requests() {
        let claims = Arc::new(ClaimSet::new());
        let acks = AcknowledgementAggregator::new(Arc::clone(&claims));
        let id = CorrelationId::from_raw("shared");
        assert!(claims.claim(&id));
        let request = AcknowledgementRequest::parse(Channel::Live, ["live-response"]).unwrap();
        assert!(matches!(
            acks.await_acknowledgements(id, &request, Duration::from_secs(1)),
            Err(RequestError::DuplicateCorrelationId(_))
        ));
    }
}
