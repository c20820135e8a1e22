//! Relay server process: public HTTP listener, QUIC control listener and
//! the background tasks tying them together

use crate::config::{ConfigError, RelayConfig};
use crate::proxy::{relay_handler, require_bearer};
use crate::state::{AppState, Registry};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use relay_auth::JwtValidator;
use relay_control::{
    BackendRegistry, BackendState, ControlHandler, CredentialVerifier, HeartbeatConfig,
    JwtVerifier, PendingError,
};
use relay_transport::{TransportConnection, TransportError, TransportListener};
use relay_transport_quic::{QuicConfig, QuicConnection, QuicListener};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bound relay, ready to serve
pub struct RelayServer {
    state: Arc<AppState>,
    handler: ControlHandler<QuicConnection>,
    quic: Arc<QuicListener>,
    http: TcpListener,
    http_addr: SocketAddr,
    control_addr: SocketAddr,
}

impl RelayServer {
    /// Validate `config` and bind both listeners
    pub async fn bind(config: RelayConfig) -> Result<Self, ServerError> {
        Self::bind_with_heartbeat(config, HeartbeatConfig::default()).await
    }

    pub async fn bind_with_heartbeat(
        config: RelayConfig,
        heartbeat: HeartbeatConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let config = Arc::new(config);

        let verifier: Arc<dyn CredentialVerifier> = Arc::new(JwtVerifier::new(
            JwtValidator::new(config.jwt_secret.as_bytes()),
        ));
        let registry: Registry = BackendRegistry::new(config.registry_config(), verifier);
        let handler = ControlHandler::new(registry.clone(), config.public_url.clone(), heartbeat);

        let quic_config = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => QuicConfig::server_with_files(cert, key),
            _ => {
                warn!("No TLS certificate configured, generating a self-signed one");
                QuicConfig::server_self_signed(&[])?
            }
        };
        let quic = QuicListener::new(config.control_addr, Arc::new(quic_config))?;
        let control_addr = quic.local_addr()?;

        let http = TcpListener::bind(config.http_addr).await?;
        let http_addr = http.local_addr()?;

        let state = Arc::new(AppState::new(config, registry));

        Ok(Self {
            state,
            handler,
            quic: Arc::new(quic),
            http,
            http_addr,
            control_addr,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serve until Ctrl+C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Serve until `shutdown` resolves, then close every backend connection
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer {
            state,
            handler,
            quic,
            http,
            http_addr,
            control_addr,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(accept_loop(quic.clone(), handler, stop_rx.clone())),
            tokio::spawn(maintenance_loop(state.clone(), stop_rx.clone())),
            tokio::spawn(eviction_loop(
                state.clone(),
                state.registry.subscribe_evictions(),
                stop_rx,
            )),
        ];

        state.set_ready(true);
        info!(http = %http_addr, control = %control_addr, "Relay listening");

        let router = router(state.clone());
        let served = axum::serve(http, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                let _ = stop_tx.send(true);
            })
            .await;

        state.set_ready(false);
        quic.close().await;
        close_backends(&state).await;
        for task in tasks {
            task.abort();
        }
        info!("Relay stopped");

        served.map_err(ServerError::Io)
    }
}

/// Public router: proxy routes plus the probes
pub fn router(state: Arc<AppState>) -> Router {
    let relay = Router::new()
        .route("/relay/{backend_id}", any(relay_handler))
        .route("/relay/{backend_id}/", any(relay_handler))
        .route("/relay/{backend_id}/{*path}", any(relay_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(relay)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let backends = state.registry.count();
    if state.is_ready() {
        Json(json!({
            "status": "ready",
            "backends": backends,
            "active": state.registry.count_active(),
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "starting", "backends": backends })),
        )
            .into_response()
    }
}

async fn accept_loop(
    listener: Arc<QuicListener>,
    handler: ControlHandler<QuicConnection>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((connection, remote)) => {
                    debug!(remote = %remote, "Control connection accepted");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(Arc::new(connection)).await;
                    });
                }
                Err(e) => {
                    info!("Control listener stopped: {}", e);
                    break;
                }
            },
        }
    }
}

async fn maintenance_loop(state: Arc<AppState>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let expired = state.pending.expire_overdue(now);
                if expired > 0 {
                    debug!(expired, "Expired overdue requests");
                }
                for backend_id in state.registry.sweep_expired(now) {
                    info!(backend_id = %backend_id, "Swept backend past its grace period");
                }
            }
        }
    }
}

/// Fail everything still waiting on an evicted backend
async fn eviction_loop(
    state: Arc<AppState>,
    mut evictions: broadcast::Receiver<String>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            evicted = evictions.recv() => match evicted {
                Ok(backend_id) => {
                    let failed = state
                        .pending
                        .fail_backend(&backend_id, PendingError::BackendGone(backend_id.clone()));
                    state.forget_limits(&backend_id);
                    if failed > 0 {
                        warn!(backend_id = %backend_id, failed, "Failed requests of evicted backend");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Eviction listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn close_backends(state: &AppState) {
    for info in state.registry.list() {
        if let Some(BackendState::Active(active)) = state.registry.lookup(&info.backend_id) {
            active.handle.close(0, "relay shutting down").await;
        }
    }
}
