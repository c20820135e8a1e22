//! State shared by every public request handler

use crate::config::RelayConfig;
use crate::proxy::http::ProxiedResponse;
use dashmap::DashMap;
use relay_auth::JwtValidator;
use relay_control::{BackendRegistry, PendingRequests};
use relay_transport_quic::QuicConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub type Registry = BackendRegistry<Arc<QuicConnection>>;

/// Per-backend backpressure: concurrent requests and buffered request bytes
pub struct BackendLimits {
    pub requests: Arc<Semaphore>,
    pub bytes: Arc<Semaphore>,
    pub max_bytes: usize,
}

impl BackendLimits {
    fn new(max_requests: usize, max_bytes: usize) -> Self {
        Self {
            requests: Arc::new(Semaphore::new(max_requests)),
            bytes: Arc::new(Semaphore::new(max_bytes)),
            max_bytes,
        }
    }
}

pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Registry,
    pub pending: PendingRequests<ProxiedResponse>,
    /// Verifies public bearer tokens when `public_auth` is on
    pub public_auth: Option<Arc<JwtValidator>>,
    limits: DashMap<String, Arc<BackendLimits>>,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(config: Arc<RelayConfig>, registry: Registry) -> Self {
        let public_auth = config
            .public_auth
            .then(|| Arc::new(JwtValidator::new(config.jwt_secret.as_bytes())));
        Self {
            config,
            registry,
            pending: PendingRequests::new(),
            public_auth,
            limits: DashMap::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn limits_for(&self, backend_id: &str) -> Arc<BackendLimits> {
        self.limits
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                Arc::new(BackendLimits::new(
                    self.config.max_pending_per_backend,
                    self.config.max_buffered_bytes_per_backend,
                ))
            })
            .clone()
    }

    pub fn forget_limits(&self, backend_id: &str) {
        self.limits.remove(backend_id);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
