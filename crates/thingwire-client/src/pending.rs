//! Requests awaiting exactly one terminal outcome.
//!
//! Every entry ends in one of three ways: resolved by the bus, failed by its
//! deadline timer, or failed because the connection went away. Whoever removes
//! the map entry first decides the outcome; the others find nothing to do.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use thingwire_core::{CorrelationId, RequestError};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::claims::ClaimSet;

type Outcome<T> = Result<T, RequestError>;

struct Entry<T> {
    tx: oneshot::Sender<Outcome<T>>,
    timer: Option<AbortHandle>,
    description: String,
    sent_at: Instant,
}

/// In-flight requests keyed by correlation id.
pub struct PendingRequests<T> {
    entries: DashMap<CorrelationId, Entry<T>>,
    claims: Arc<ClaimSet>,
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new(claims: Arc<ClaimSet>) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            claims,
        })
    }

    /// Claim `id` and start its deadline. Must run inside a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        description: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResponseHandle<T>, RequestError> {
        if !self.claims.claim(&id) {
            return Err(RequestError::DuplicateCorrelationId(id));
        }
        let (tx, rx) = oneshot::channel();
        let description = description.into();
        trace!(correlation_id = %id, request = %description, "request pending");
        let _ = self.entries.insert(
            id.clone(),
            Entry {
                tx,
                timer: None,
                description,
                sent_at: Instant::now(),
            },
        );

        let timer = tokio::spawn(expire(Arc::downgrade(self), id.clone(), timeout)).abort_handle();
        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        Ok(ResponseHandle { id, rx })
    }

    pub fn resolve(&self, id: &CorrelationId, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    pub fn fail(&self, id: &CorrelationId, error: RequestError) -> bool {
        self.complete(id, Err(error))
    }

    /// Drop the entry without notifying its handle.
    pub fn discard(&self, id: &CorrelationId) -> bool {
        self.take(id).is_some()
    }

    /// Fail every entry with the error `make` builds for it.
    pub fn fail_all(&self, make: impl Fn(&CorrelationId) -> RequestError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.fail(id, make(id))).count()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn complete(&self, id: &CorrelationId, outcome: Outcome<T>) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        debug!(
            correlation_id = %id,
            request = %entry.description,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request completed"
        );
        let _ = entry.tx.send(outcome);
        true
    }

    fn take(&self, id: &CorrelationId) -> Option<Entry<T>> {
        let (_, entry) = self.entries.remove(id)?;
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        self.claims.release(id);
        Some(entry)
    }
}

async fn expire<T: Send + 'static>(registry: Weak<PendingRequests<T>>, id: CorrelationId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(registry) = registry.upgrade() {
        let error = RequestError::Timeout {
            correlation_id: id.clone(),
            timeout,
        };
        let _ = registry.fail(&id, error);
    }
}

/// Completes with the response, a timeout, or connection loss.
#[derive(Debug)]
pub struct ResponseHandle<T> {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> ResponseHandle<T> {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }
}

impl<T> Future for ResponseHandle<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::ConnectionLost(this.id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<PendingRequests<u32>> {
        PendingRequests::new(Arc::new(ClaimSet::new()))
    }

    #[tokio::test]
    async fn resolve_delivers_value() {
        let pending = registry();
        let id = CorrelationId::from_raw("c-1");
        let handle = pending.register(id.clone(), "test", Duration::from_secs(60)).unwrap();
        assert!(pending.contains(&id));

        assert!(pending.resolve(&id, 7));
        assert_eq!(handle.await.unwrap(), 7);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let pending = registry();
        let id = CorrelationId::from_raw("dup");
        let _first = pending.register(id.clone(), "a", Duration::from_secs(60)).unwrap();
        let second = pending.register(id.clone(), "b", Duration::from_secs(60));
        assert!(matches!(second, Err(RequestError::DuplicateCorrelationId(d)) if d == id));
    }

    #[tokio::test]
    async fn id_is_reusable_after_completion() {
        let pending = registry();
        let id = CorrelationId::from_raw("again");
        let handle = pending.register(id.clone(), "a", Duration::from_secs(60)).unwrap();
        assert!(pending.resolve(&id, 1));
        assert_eq!(handle.await.unwrap(), 1);
        assert!(pending.register(id, "b", Duration::from_secs(60)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_with_timeout() {
        let pending = registry();
        let id = CorrelationId::from_raw("slow");
        let handle = pending.register(id.clone(), "slow", Duration::from_millis(50)).unwrap();

        let result = handle.await;
        assert!(matches!(result, Err(RequestError::Timeout { timeout, .. }) if timeout == Duration::from_millis(50)));
        assert!(!pending.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_ignored() {
        let pending = registry();
        let id = CorrelationId::from_raw("late");
        let handle = pending.register(id.clone(), "late", Duration::from_millis(10)).unwrap();
        assert!(matches!(handle.await, Err(RequestError::Timeout { .. })));
        assert!(!pending.resolve(&id, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_timer() {
        let pending = registry();
        let id = CorrelationId::from_raw("fast");
        let handle = pending.register(id.clone(), "fast", Duration::from_millis(10)).unwrap();
        assert!(pending.resolve(&id, 5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.await.unwrap(), 5);
        assert!(!pending.fail(&id, RequestError::ConnectionLost(id.clone())));
    }

    #[tokio::test]
    async fn fail_all_reports_connection_lost() {
        let pending = registry();
        let a = pending.register(CorrelationId::from_raw("a"), "a", Duration::from_secs(60)).unwrap();
        let b = pending.register(CorrelationId::from_raw("b"), "b", Duration::from_secs(60)).unwrap();

        let failed = pending.fail_all(|id| RequestError::ConnectionLost(id.clone()));
        assert_eq!(failed, 2);
        assert!(matches!(a.await, Err(RequestError::ConnectionLost(id)) if id.as_str() == "a"));
        assert!(matches!(b.await, Err(RequestError::ConnectionLost(id)) if id.as_str() == "b"));
    }

    #[tokio::test]
    async fn discard_releases_claim_silently() {
        let claims = Arc::new(ClaimSet::new());
        let pending: Arc<PendingRequests<u32>> = PendingRequests::new(Arc::clone(&claims));
        let id = CorrelationId::from_raw("gone");
        let handle = pending.register(id.clone(), "gone", Duration::from_secs(60)).unwrap();
        assert!(pending.discard(&id));
        assert!(!claims.is_claimed(&id));
        assert!(matches!(handle.await, Err(RequestError::ConnectionLost(_))));
    }
}
