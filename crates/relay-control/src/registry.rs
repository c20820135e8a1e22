//! Backend registry
//!
//! One entry per backend id. An entry survives the loss of its control
//! connection for a grace period, during which lookups still succeed and
//! requests queue in [`BackendRegistry::wait_active`] until the backend
//! resumes or is evicted.

use crate::auth::{AuthError, CredentialVerifier};
use crate::session::SessionTicket;
use crate::task_tracker::TaskTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to do when an id that is already active registers again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Refuse the second registration
    Reject,
    /// Accept the new connection and close the old one
    #[default]
    Supersede,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicatePolicy::Reject),
            "supersede" => Ok(DuplicatePolicy::Supersede),
            other => Err(format!(
                "unknown duplicate policy '{}', expected 'reject' or 'supersede'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub grace_period: Duration,
    pub max_backends: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            max_backends: 100,
            duplicate_policy: DuplicatePolicy::Supersede,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("backend {0} is already registered")]
    Duplicate(String),

    #[error("registry is full ({0} backends)")]
    LimitReached(usize),

    #[error("no registration held for backend {0}")]
    NotFound(String),

    #[error("session ticket does not match for backend {0}")]
    TicketMismatch(String),

    #[error("backend {0} is unavailable")]
    Unavailable(String),

    #[error("timed out waiting for backend {0}")]
    Timeout(String),
}

/// Externally visible lifecycle of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Active,
    Reconnecting {
        since: Instant,
        grace_deadline: Instant,
    },
    Gone,
}

/// Value published on every entry's watch channel
#[derive(Debug, Clone)]
pub enum BackendState<H> {
    Active(ActiveBackend<H>),
    Reconnecting { grace_deadline: Instant },
    Gone,
}

/// A live backend: its control connection handle and that connection's id
#[derive(Debug, Clone)]
pub struct ActiveBackend<H> {
    pub handle: H,
    pub connection_id: u64,
}

/// Result of a successful register or resume
#[derive(Debug)]
pub struct Registration<H> {
    pub ticket: SessionTicket,
    pub resumed: bool,
    /// A previous live connection this registration replaced. The caller closes it.
    pub superseded: Option<H>,
}

/// Summary row for listings and probes
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub backend_id: String,
    pub connection_id: u64,
    pub registered_at: DateTime<Utc>,
    pub status: &'static str,
}

struct RegisteredBackend<H> {
    handle: H,
    connection_id: u64,
    registered_at: DateTime<Utc>,
    status: BackendStatus,
    ticket: SessionTicket,
    generation: u64,
    state_tx: watch::Sender<BackendState<H>>,
}

impl<H: Clone> RegisteredBackend<H> {
    fn new(handle: H, connection_id: u64) -> Self {
        let (state_tx, _) = watch::channel(BackendState::Active(ActiveBackend {
            handle: handle.clone(),
            connection_id,
        }));
        Self {
            handle,
            connection_id,
            registered_at: Utc::now(),
            status: BackendStatus::Active,
            ticket: SessionTicket::generate(),
            generation: 0,
            state_tx,
        }
    }

    /// Point the entry at a new live connection and issue a fresh ticket
    fn activate(&mut self, handle: H, connection_id: u64) -> H {
        let previous = std::mem::replace(&mut self.handle, handle.clone());
        self.connection_id = connection_id;
        self.status = BackendStatus::Active;
        self.ticket = SessionTicket::generate();
        self.generation += 1;
        self.state_tx.send_replace(BackendState::Active(ActiveBackend {
            handle,
            connection_id,
        }));
        previous
    }

    fn status_name(&self) -> &'static str {
        match self.status {
            BackendStatus::Active => "active",
            BackendStatus::Reconnecting { .. } => "reconnecting",
            BackendStatus::Gone => "gone",
        }
    }
}

struct RegistryInner<H> {
    backends: RwLock<HashMap<String, RegisteredBackend<H>>>,
    config: RegistryConfig,
    verifier: Arc<dyn CredentialVerifier>,
    grace_timers: TaskTracker,
    evictions: broadcast::Sender<String>,
}

/// Registry of attached backends, cheap to clone and shared by all handlers
pub struct BackendRegistry<H> {
    inner: Arc<RegistryInner<H>>,
}

impl<H> Clone for BackendRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H> BackendRegistry<H>
where
    H: Clone + Send + Sync + 'static,
{
    pub fn new(config: RegistryConfig, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let (evictions, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RegistryInner {
                backends: RwLock::new(HashMap::new()),
                config,
                verifier,
                grace_timers: TaskTracker::new(),
                evictions,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredBackend<H>>> {
        self.inner.backends.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RegisteredBackend<H>>> {
        self.inner
            .backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Ids evicted from the registry, for cleaning up state keyed by backend
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<String> {
        self.inner.evictions.subscribe()
    }

    /// Full registration of `backend_id` on a new control connection
    pub fn register(
        &self,
        backend_id: &str,
        handle: H,
        connection_id: u64,
        credential: &str,
    ) -> Result<Registration<H>, RegistryError> {
        self.inner.verifier.verify(backend_id, credential)?;

        let mut backends = self.write();

        if let Some(entry) = backends.get_mut(backend_id) {
            let was_active = matches!(entry.status, BackendStatus::Active);
            if was_active && self.inner.config.duplicate_policy == DuplicatePolicy::Reject {
                warn!(backend_id = %backend_id, "Rejecting duplicate registration");
                return Err(RegistryError::Duplicate(backend_id.to_string()));
            }

            let previous = entry.activate(handle, connection_id);
            let ticket = entry.ticket.clone();
            drop(backends);
            self.inner.grace_timers.cancel(backend_id);

            if was_active {
                info!(backend_id = %backend_id, connection_id, "Backend superseded by new registration");
            } else {
                info!(backend_id = %backend_id, connection_id, "Backend re-registered during grace period");
            }

            return Ok(Registration {
                ticket,
                resumed: false,
                superseded: was_active.then_some(previous),
            });
        }

        if backends.len() >= self.inner.config.max_backends {
            warn!(
                backend_id = %backend_id,
                max = self.inner.config.max_backends,
                "Registry full, refusing backend"
            );
            return Err(RegistryError::LimitReached(self.inner.config.max_backends));
        }

        let entry = RegisteredBackend::new(handle, connection_id);
        let ticket = entry.ticket.clone();
        backends.insert(backend_id.to_string(), entry);

        info!(backend_id = %backend_id, connection_id, "Backend registered");
        Ok(Registration {
            ticket,
            resumed: false,
            superseded: None,
        })
    }

    /// Resume a held registration with the ticket issued last time
    pub fn resume(
        &self,
        backend_id: &str,
        handle: H,
        connection_id: u64,
        credential: &str,
        presented_ticket: &[u8],
    ) -> Result<Registration<H>, RegistryError> {
        self.inner.verifier.verify(backend_id, credential)?;

        let mut backends = self.write();
        let entry = backends
            .get_mut(backend_id)
            .ok_or_else(|| RegistryError::NotFound(backend_id.to_string()))?;

        if !entry.ticket.matches(presented_ticket) {
            warn!(backend_id = %backend_id, "Resume refused, ticket mismatch");
            return Err(RegistryError::TicketMismatch(backend_id.to_string()));
        }

        // The agent can notice the loss before we do; the old connection is then still "active".
        let was_active = matches!(entry.status, BackendStatus::Active);
        let previous = entry.activate(handle, connection_id);
        let ticket = entry.ticket.clone();
        drop(backends);
        self.inner.grace_timers.cancel(backend_id);

        info!(backend_id = %backend_id, connection_id, "Backend resumed");
        Ok(Registration {
            ticket,
            resumed: true,
            superseded: was_active.then_some(previous),
        })
    }

    /// Current state of an entry, if one is held
    pub fn lookup(&self, backend_id: &str) -> Option<BackendState<H>> {
        self.read()
            .get(backend_id)
            .map(|entry| entry.state_tx.borrow().clone())
    }

    pub fn status(&self, backend_id: &str) -> Option<BackendStatus> {
        self.read().get(backend_id).map(|entry| entry.status)
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.read().contains_key(backend_id)
    }

    /// Wait until the backend is active, queueing through a grace period
    pub async fn wait_active(
        &self,
        backend_id: &str,
        deadline: Instant,
    ) -> Result<ActiveBackend<H>, RegistryError> {
        let mut rx = {
            let backends = self.read();
            let entry = backends
                .get(backend_id)
                .ok_or_else(|| RegistryError::Unavailable(backend_id.to_string()))?;
            entry.state_tx.subscribe()
        };

        let waited = tokio::time::timeout_at(
            deadline,
            rx.wait_for(|state| !matches!(state, BackendState::Reconnecting { .. })),
        )
        .await;

        match waited {
            Ok(Ok(state)) => match &*state {
                BackendState::Active(active) => Ok(active.clone()),
                _ => Err(RegistryError::Unavailable(backend_id.to_string())),
            },
            Ok(Err(_)) => Err(RegistryError::Unavailable(backend_id.to_string())),
            Err(_) => Err(RegistryError::Timeout(backend_id.to_string())),
        }
    }

    /// Enter the grace period after `connection_id` was lost
    ///
    /// Ignored when the entry has already moved to a newer connection.
    pub fn mark_reconnecting(&self, backend_id: &str, connection_id: u64) -> bool {
        let grace = self.inner.config.grace_period;
        let now = Instant::now();
        let grace_deadline = now + grace;

        let generation = {
            let mut backends = self.write();
            let Some(entry) = backends.get_mut(backend_id) else {
                return false;
            };
            if entry.connection_id != connection_id
                || !matches!(entry.status, BackendStatus::Active)
            {
                debug!(backend_id = %backend_id, connection_id, "Stale connection loss, ignoring");
                return false;
            }
            entry.status = BackendStatus::Reconnecting {
                since: now,
                grace_deadline,
            };
            entry.generation += 1;
            entry
                .state_tx
                .send_replace(BackendState::Reconnecting { grace_deadline });
            entry.generation
        };

        warn!(
            backend_id = %backend_id,
            grace_secs = grace.as_secs(),
            "Control connection lost, holding registration"
        );

        let registry = self.clone();
        let id = backend_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(grace_deadline).await;
            registry.expire_grace(&id, generation);
        });
        self.inner
            .grace_timers
            .register(backend_id.to_string(), timer);
        true
    }

    fn expire_grace(&self, backend_id: &str, generation: u64) {
        if self.evict_if_expired(backend_id, generation, Instant::now()) {
            self.inner.grace_timers.forget(backend_id);
        }
    }

    /// Evict `backend_id` only if it is still the same reconnecting entry and its deadline passed
    ///
    /// The check and the removal happen under one write lock, so a resume
    /// that lands first keeps the entry.
    pub fn evict_if_expired(&self, backend_id: &str, generation: u64, now: Instant) -> bool {
        let removed = self.remove_where(backend_id, |entry| {
            entry.generation == generation
                && matches!(
                    entry.status,
                    BackendStatus::Reconnecting { grace_deadline, .. } if grace_deadline <= now
                )
        });
        if removed.is_some() {
            info!(backend_id = %backend_id, "Grace period elapsed");
        }
        removed.is_some()
    }

    fn remove_where(
        &self,
        backend_id: &str,
        condition: impl FnOnce(&RegisteredBackend<H>) -> bool,
    ) -> Option<H> {
        let entry = {
            let mut backends = self.write();
            if !backends.get(backend_id).is_some_and(condition) {
                return None;
            }
            backends.remove(backend_id)?
        };
        entry.state_tx.send_replace(BackendState::Gone);
        let _ = self.inner.evictions.send(backend_id.to_string());
        info!(backend_id = %backend_id, "Backend evicted");
        Some(entry.handle)
    }

    fn remove_entry(&self, backend_id: &str) -> Option<H> {
        self.remove_where(backend_id, |_| true)
    }

    /// Remove an entry regardless of its state
    pub fn evict(&self, backend_id: &str) -> Option<H> {
        self.inner.grace_timers.cancel(backend_id);
        self.remove_entry(backend_id)
    }

    /// Explicit unregister from the connection that owns the entry
    pub fn unregister(&self, backend_id: &str, connection_id: u64) -> bool {
        let removed = self.remove_where(backend_id, |entry| entry.connection_id == connection_id);
        if removed.is_some() {
            self.inner.grace_timers.cancel(backend_id);
        }
        removed.is_some()
    }

    /// Evict entries whose grace period is over; returns their ids
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<(String, u64)> = self
            .read()
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.status, BackendStatus::Reconnecting { grace_deadline, .. } if grace_deadline <= now)
            })
            .map(|(id, entry)| (id.clone(), entry.generation))
            .collect();

        candidates
            .into_iter()
            .filter(|(id, generation)| {
                let evicted = self.evict_if_expired(id, *generation, now);
                if evicted {
                    self.inner.grace_timers.cancel(id);
                }
                evicted
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self
            .read()
            .iter()
            .map(|(id, entry)| BackendInfo {
                backend_id: id.clone(),
                connection_id: entry.connection_id,
                registered_at: entry.registered_at,
                status: entry.status_name(),
            })
            .collect();
        infos.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        infos
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn count_active(&self) -> usize {
        self.read()
            .values()
            .filter(|entry| matches!(entry.status, BackendStatus::Active))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_all() -> Arc<dyn CredentialVerifier> {
        Arc::new(|_: &str, _: &str| Ok(()))
    }

    fn registry(policy: DuplicatePolicy) -> BackendRegistry<&'static str> {
        BackendRegistry::new(
            RegistryConfig {
                grace_period: Duration::from_secs(5),
                max_backends: 2,
                duplicate_policy: policy,
            },
            allow_all(),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry(DuplicatePolicy::Supersede);
        let reg = registry.register("ws-1", "conn-a", 1, "tok").unwrap();

        assert!(!reg.resumed);
        assert!(reg.superseded.is_none());
        assert!(matches!(
            registry.lookup("ws-1"),
            Some(BackendState::Active(ActiveBackend { handle: "conn-a", connection_id: 1 }))
        ));
        assert!(registry.lookup("ws-2").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_no_entry() {
        let verifier: Arc<dyn CredentialVerifier> =
            Arc::new(|_: &str, _: &str| Err(AuthError::Invalid("bad signature".into())));
        let registry: BackendRegistry<&str> =
            BackendRegistry::new(RegistryConfig::default(), verifier);

        let err = registry.register("ws-1", "conn-a", 1, "tok").unwrap_err();
        assert!(matches!(err, RegistryError::Auth(_)));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reject_keeps_first() {
        let registry = registry(DuplicatePolicy::Reject);
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();

        let err = registry.register("ws-1", "conn-b", 2, "tok").unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("ws-1".into()));
        assert!(matches!(
            registry.lookup("ws-1"),
            Some(BackendState::Active(ActiveBackend { handle: "conn-a", .. }))
        ));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_supersede_replaces_first() {
        let registry = registry(DuplicatePolicy::Supersede);
        let first = registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        let second = registry.register("ws-1", "conn-b", 2, "tok").unwrap();

        assert_eq!(second.superseded, Some("conn-a"));
        assert_ne!(first.ticket, second.ticket);
        assert!(matches!(
            registry.lookup("ws-1"),
            Some(BackendState::Active(ActiveBackend { handle: "conn-b", connection_id: 2 }))
        ));
        assert_eq!(registry.count(), 1);

        // Loss of the superseded connection must not touch the new one
        assert!(!registry.mark_reconnecting("ws-1", 1));
        assert_eq!(registry.status("ws-1"), Some(BackendStatus::Active));
    }

    #[tokio::test]
    async fn test_limit_reached() {
        let registry = registry(DuplicatePolicy::Supersede);
        registry.register("a", "c1", 1, "tok").unwrap();
        registry.register("b", "c2", 2, "tok").unwrap();

        assert_eq!(
            registry.register("c", "c3", 3, "tok").unwrap_err(),
            RegistryError::LimitReached(2)
        );
        // Re-registering an existing id is not a new slot
        assert!(registry.register("a", "c4", 4, "tok").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_within_grace() {
        let registry = registry(DuplicatePolicy::Reject);
        let reg = registry.register("ws-1", "conn-a", 1, "tok").unwrap();

        assert!(registry.mark_reconnecting("ws-1", 1));
        assert!(matches!(
            registry.lookup("ws-1"),
            Some(BackendState::Reconnecting { .. })
        ));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_active("ws-1", Instant::now() + Duration::from_secs(10))
                    .await
            })
        };

        tokio::time::advance(Duration::from_secs(2)).await;
        let resumed = registry
            .resume("ws-1", "conn-b", 2, "tok", reg.ticket.as_bytes())
            .unwrap();
        assert!(resumed.resumed);
        assert!(resumed.superseded.is_none());
        assert_ne!(resumed.ticket, reg.ticket);

        let active = waiter.await.unwrap().unwrap();
        assert_eq!(active.handle, "conn-b");
        assert_eq!(active.connection_id, 2);

        // Grace timer was cancelled: nothing is evicted later
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.status("ws-1"), Some(BackendStatus::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_evicts_and_wakes_waiters() {
        let registry = registry(DuplicatePolicy::Reject);
        let mut evictions = registry.subscribe_evictions();
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_active("ws-1", Instant::now() + Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            RegistryError::Unavailable("ws-1".into())
        );
        assert!(registry.lookup("ws-1").is_none());
        assert_eq!(evictions.recv().await.unwrap(), "ws-1");
    }

    #[tokio::test]
    async fn test_stale_ticket_refused() {
        let registry = registry(DuplicatePolicy::Reject);
        let first = registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);
        let resumed = registry
            .resume("ws-1", "conn-b", 2, "tok", first.ticket.as_bytes())
            .unwrap();

        registry.mark_reconnecting("ws-1", 2);
        // The first ticket was rotated away
        assert_eq!(
            registry
                .resume("ws-1", "conn-c", 3, "tok", first.ticket.as_bytes())
                .unwrap_err(),
            RegistryError::TicketMismatch("ws-1".into())
        );
        assert!(registry
            .resume("ws-1", "conn-c", 3, "tok", resumed.ticket.as_bytes())
            .is_ok());
    }

    #[tokio::test]
    async fn test_resume_unknown_backend() {
        let registry = registry(DuplicatePolicy::Reject);
        assert_eq!(
            registry
                .resume("ws-9", "conn", 1, "tok", &[0u8; 32])
                .unwrap_err(),
            RegistryError::NotFound("ws-9".into())
        );
    }

    #[tokio::test]
    async fn test_reconnecting_entry_accepts_register_under_reject() {
        let registry = registry(DuplicatePolicy::Reject);
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);

        let reg = registry.register("ws-1", "conn-b", 2, "tok").unwrap();
        assert!(reg.superseded.is_none());
        assert_eq!(registry.status("ws-1"), Some(BackendStatus::Active));
    }

    #[tokio::test]
    async fn test_unregister_requires_owning_connection() {
        let registry = registry(DuplicatePolicy::Supersede);
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.register("ws-1", "conn-b", 2, "tok").unwrap();

        assert!(!registry.unregister("ws-1", 1));
        assert!(registry.contains("ws-1"));
        assert!(registry.unregister("ws-1", 2));
        assert!(!registry.contains("ws-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_active_times_out() {
        let registry = registry(DuplicatePolicy::Reject);
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);

        let err = registry
            .wait_active("ws-1", Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Timeout("ws-1".into()));
    }

    #[tokio::test]
    async fn test_wait_active_unknown_is_immediate() {
        let registry = registry(DuplicatePolicy::Reject);
        let err = registry
            .wait_active("ws-missing", Instant::now() + Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Unavailable("ws-missing".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let registry = registry(DuplicatePolicy::Reject);
        registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.register("ws-2", "conn-b", 2, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);

        assert!(registry.sweep_expired(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(6);
        assert_eq!(registry.sweep_expired(later), vec!["ws-1".to_string()]);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.count_active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_spares_entry_resumed_since() {
        let registry = registry(DuplicatePolicy::Reject);
        let reg = registry.register("ws-1", "conn-a", 1, "tok").unwrap();
        registry.mark_reconnecting("ws-1", 1);
        let generation = registry.read()["ws-1"].generation;

        registry
            .resume("ws-1", "conn-b", 2, "tok", reg.ticket.as_bytes())
            .unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        assert!(!registry.evict_if_expired("ws-1", generation, later));
        assert!(registry.sweep_expired(later).is_empty());
        assert_eq!(registry.status("ws-1"), Some(BackendStatus::Active));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sweep_racing_resume_never_drops_resumed_backend() {
        let registry = registry(DuplicatePolicy::Reject);

        for i in 0..2_000u64 {
            let reg = registry.register("ws-1", "conn-a", i * 2, "tok").unwrap();
            assert!(registry.mark_reconnecting("ws-1", i * 2));
            let later = Instant::now() + Duration::from_secs(60);

            let resumed = std::thread::scope(|scope| {
                scope.spawn(|| registry.sweep_expired(later));
                scope
                    .spawn(|| {
                        registry.resume("ws-1", "conn-b", i * 2 + 1, "tok", reg.ticket.as_bytes())
                    })
                    .join()
                    .unwrap()
            });

            if resumed.is_ok() {
                assert_eq!(
                    registry.status("ws-1"),
                    Some(BackendStatus::Active),
                    "iteration {}",
                    i
                );
            } else {
                assert!(!registry.contains("ws-1"), "iteration {}", i);
            }
            registry.evict("ws-1");
        }
    }

    #[test]
    fn test_duplicate_policy_parse() {
        assert_eq!("reject".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Reject));
        assert_eq!(
            "Supersede".parse::<DuplicatePolicy>(),
            Ok(DuplicatePolicy::Supersede)
        );
        assert!("latest".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Supersede);
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = registry(DuplicatePolicy::Reject);
        registry.register("b", "c2", 2, "tok").unwrap();
        registry.register("a", "c1", 1, "tok").unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|i| i.backend_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
