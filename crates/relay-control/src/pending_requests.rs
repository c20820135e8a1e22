//! Tracking of in-flight public requests
//!
//! Every request proxied to a backend is registered here under the stream
//! that carries it. Whoever gets to the entry first (the stream reader with
//! a response, the handler's timeout, or a backend eviction) removes it and
//! delivers the outcome, so each request resolves exactly once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identifies one request: the connection it went out on and the stream
/// carrying it. Stream ids are only unique within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    pub connection_id: u64,
    pub stream_id: u64,
}

impl CorrelationId {
    pub fn new(connection_id: u64, stream_id: u64) -> Self {
        Self {
            connection_id,
            stream_id,
        }
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.connection_id, self.stream_id)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    #[error("request timed out")]
    Timeout,

    #[error("backend {0} is gone")]
    BackendGone(String),

    #[error("connection lost before the response arrived")]
    ConnectionLost,

    #[error("stream closed without a response")]
    NoResponse,

    #[error("request was cancelled")]
    Cancelled,

    #[error("a request is already pending for {0}")]
    AlreadyPending(CorrelationId),
}

pub type PendingOutcome<T> = Result<T, PendingError>;

/// Read-only view of a pending entry
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub backend_id: String,
    pub created_at: Instant,
    pub timeout_at: Instant,
}

struct PendingEntry<T> {
    backend_id: String,
    created_at: Instant,
    timeout_at: Instant,
    tx: oneshot::Sender<PendingOutcome<T>>,
}

/// Table of requests waiting for a backend response
pub struct PendingRequests<T> {
    requests: Arc<DashMap<CorrelationId, PendingEntry<T>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a request and get the receiver its outcome arrives on
    pub fn register(
        &self,
        id: CorrelationId,
        backend_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<PendingOutcome<T>>, PendingError> {
        let now = Instant::now();
        self.register_until(id, backend_id, now, now + timeout)
    }

    /// Register a request with an absolute deadline
    pub fn register_until(
        &self,
        id: CorrelationId,
        backend_id: impl Into<String>,
        created_at: Instant,
        timeout_at: Instant,
    ) -> Result<oneshot::Receiver<PendingOutcome<T>>, PendingError> {
        match self.requests.entry(id) {
            Entry::Occupied(_) => {
                warn!(correlation_id = %id, "Request already pending on this stream");
                Err(PendingError::AlreadyPending(id))
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingEntry {
                    backend_id: backend_id.into(),
                    created_at,
                    timeout_at,
                    tx,
                });
                debug!(correlation_id = %id, "Registered pending request");
                Ok(rx)
            }
        }
    }

    fn resolve(&self, id: &CorrelationId, outcome: PendingOutcome<T>) -> bool {
        match self.requests.remove(id) {
            Some((_, entry)) => {
                if entry.tx.send(outcome).is_err() {
                    debug!(correlation_id = %id, "Request waiter already gone");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Deliver a response. Returns false if the request was already resolved.
    pub fn respond(&self, id: &CorrelationId, response: T) -> bool {
        let delivered = self.resolve(id, Ok(response));
        if delivered {
            debug!(correlation_id = %id, "Delivered response to pending request");
        } else {
            debug!(correlation_id = %id, "Late response for resolved request, dropping");
        }
        delivered
    }

    /// Resolve a request with an error
    pub fn fail(&self, id: &CorrelationId, error: PendingError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Resolve a request as timed out
    pub fn expire(&self, id: &CorrelationId) -> bool {
        let expired = self.resolve(id, Err(PendingError::Timeout));
        if expired {
            debug!(correlation_id = %id, "Pending request timed out");
        }
        expired
    }

    /// Drop a request without delivering anything (caller went away)
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let removed = self.requests.remove(id).is_some();
        if removed {
            debug!(correlation_id = %id, "Cancelled pending request");
        }
        removed
    }

    /// Expire every request whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<CorrelationId> = self
            .requests
            .iter()
            .filter(|e| e.value().timeout_at <= now)
            .map(|e| *e.key())
            .collect();

        overdue.iter().filter(|id| self.expire(id)).count()
    }

    /// Fail every request for a backend
    pub fn fail_backend(&self, backend_id: &str, error: PendingError) -> usize {
        let ids: Vec<CorrelationId> = self
            .requests
            .iter()
            .filter(|e| e.value().backend_id == backend_id)
            .map(|e| *e.key())
            .collect();

        let failed = ids
            .iter()
            .filter(|id| self.fail(id, error.clone()))
            .count();
        if failed > 0 {
            warn!(backend_id = %backend_id, failed, error = %error, "Failed pending requests");
        }
        failed
    }

    /// Fail every request carried by a connection
    pub fn fail_connection(&self, connection_id: u64, error: PendingError) -> usize {
        let ids: Vec<CorrelationId> = self
            .requests
            .iter()
            .filter(|e| e.key().connection_id == connection_id)
            .map(|e| *e.key())
            .collect();

        ids.iter().filter(|id| self.fail(id, error.clone())).count()
    }

    /// Wait for the outcome of a registered request until its deadline
    ///
    /// On deadline the request is expired here; if a response won the race
    /// that response is returned instead.
    pub async fn wait(
        &self,
        id: CorrelationId,
        mut rx: oneshot::Receiver<PendingOutcome<T>>,
        deadline: Instant,
    ) -> PendingOutcome<T> {
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PendingError::Cancelled),
            Err(_) => {
                if self.expire(&id) {
                    Err(PendingError::Timeout)
                } else {
                    // Someone else removed the entry and is about to send.
                    rx.await.unwrap_or(Err(PendingError::Timeout))
                }
            }
        }
    }

    pub fn info(&self, id: &CorrelationId) -> Option<PendingInfo> {
        self.requests.get(id).map(|e| PendingInfo {
            backend_id: e.backend_id.clone(),
            created_at: e.created_at,
            timeout_at: e.timeout_at,
        })
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn count_for(&self, backend_id: &str) -> usize {
        self.requests
            .iter()
            .filter(|e| e.value().backend_id == backend_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cid(stream_id: u64) -> CorrelationId {
        CorrelationId::new(1, stream_id)
    }

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending: PendingRequests<String> = PendingRequests::new();
        let rx = pending
            .register(cid(4), "ws-1", Duration::from_secs(5))
            .unwrap();

        assert_eq!(pending.count(), 1);
        let info = pending.info(&cid(4)).unwrap();
        assert_eq!(info.backend_id, "ws-1");
        assert_eq!(info.timeout_at - info.created_at, Duration::from_secs(5));
        assert!(pending.respond(&cid(4), "hello".to_string()));
        assert!(pending.info(&cid(4)).is_none());
        assert_eq!(rx.await.unwrap(), Ok("hello".to_string()));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let pending: PendingRequests<()> = PendingRequests::new();
        let _rx = pending
            .register(cid(4), "ws-1", Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            pending
                .register(cid(4), "ws-1", Duration::from_secs(5))
                .unwrap_err(),
            PendingError::AlreadyPending(cid(4))
        );
        // Same stream id on another connection is a different request
        assert!(pending
            .register(CorrelationId::new(2, 4), "ws-1", Duration::from_secs(5))
            .is_ok());
    }

    #[tokio::test]
    async fn test_respond_after_expire_is_ignored() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending
            .register(cid(8), "ws-1", Duration::from_secs(5))
            .unwrap();

        assert!(pending.expire(&cid(8)));
        assert!(!pending.respond(&cid(8), 7));
        assert_eq!(rx.await.unwrap(), Err(PendingError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_drops_waiter() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending
            .register(cid(8), "ws-1", Duration::from_secs(5))
            .unwrap();

        assert!(pending.cancel(&cid(8)));
        assert!(!pending.cancel(&cid(8)));
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending
            .register(cid(1), "ws-1", Duration::from_secs(2))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);

        let outcome = pending.wait(cid(1), rx, deadline).await;
        assert_eq!(outcome, Err(PendingError::Timeout));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let _a = pending
            .register(cid(1), "ws-1", Duration::from_secs(1))
            .unwrap();
        let _b = pending
            .register(cid(5), "ws-1", Duration::from_secs(10))
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pending.expire_overdue(Instant::now()), 1);
        assert!(pending.contains(&cid(5)));
        assert!(!pending.contains(&cid(1)));
    }

    #[tokio::test]
    async fn test_fail_backend_only_touches_that_backend() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let a = pending
            .register(cid(1), "ws-1", Duration::from_secs(5))
            .unwrap();
        let _b = pending
            .register(cid(5), "ws-2", Duration::from_secs(5))
            .unwrap();

        assert_eq!(pending.count_for("ws-1"), 1);
        let failed = pending.fail_backend("ws-1", PendingError::BackendGone("ws-1".into()));
        assert_eq!(failed, 1);
        assert_eq!(
            a.await.unwrap(),
            Err(PendingError::BackendGone("ws-1".into()))
        );
        assert_eq!(pending.count_for("ws-2"), 1);
    }

    #[tokio::test]
    async fn test_fail_connection() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let _a = pending
            .register(CorrelationId::new(1, 1), "ws-1", Duration::from_secs(5))
            .unwrap();
        let _b = pending
            .register(CorrelationId::new(2, 1), "ws-1", Duration::from_secs(5))
            .unwrap();

        assert_eq!(pending.fail_connection(1, PendingError::ConnectionLost), 1);
        assert_eq!(pending.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_response_and_timeout_resolve_once() {
        let pending: PendingRequests<u64> = PendingRequests::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for i in 0..1000u64 {
            let rx = pending
                .register(cid(i), "ws-1", Duration::from_secs(30))
                .unwrap();
            receivers.push(rx);
        }

        let mut tasks = Vec::new();
        for i in 0..1000u64 {
            let p = pending.clone();
            let d = delivered.clone();
            tasks.push(tokio::spawn(async move {
                if p.respond(&cid(i), i) {
                    d.fetch_add(1, Ordering::SeqCst);
                }
            }));
            let p = pending.clone();
            let e = expired.clone();
            tasks.push(tokio::spawn(async move {
                if p.expire(&cid(i)) {
                    e.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(
            delivered.load(Ordering::SeqCst) + expired.load(Ordering::SeqCst),
            1000
        );
        for (i, rx) in receivers.into_iter().enumerate() {
            match rx.await.unwrap() {
                Ok(v) => assert_eq!(v, i as u64),
                Err(e) => assert_eq!(e, PendingError::Timeout),
            }
        }
        assert_eq!(pending.count(), 0);
    }
}
