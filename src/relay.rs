//! Run a relay in-process
//!
//! ```ignore
//! use tunnel_relay::RelayBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tunnel_relay::RelayBuilderError> {
//! let relay = RelayBuilder::new("a-secret-of-at-least-thirty-two-bytes!")
//!     .http_addr("127.0.0.1:8080")?
//!     .control_addr("127.0.0.1:4443")?
//!     .grace_period(Duration::from_secs(10))
//!     .start()
//!     .await?;
//!
//! let config = relay.agent_config("my-app", "127.0.0.1:3000")?;
//! // hand `config` to relay_agent::Agent::new
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use chrono::Duration as TokenValidity;
use relay_agent::AgentConfig;
use relay_auth::{JwtError, SharedSecret};
use relay_control::{DuplicatePolicy, HeartbeatConfig};
use relay_server::{AppState, RelayConfig, RelayServer, ServerError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum RelayBuilderError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Token generation error: {0}")]
    Token(#[from] JwtError),

    #[error("Relay task failed: {0}")]
    Task(String),
}

/// Mint a backend token signed with the relay's secret
pub fn generate_token(
    secret: &str,
    backend_id: &str,
    hours_valid: i64,
) -> Result<String, RelayBuilderError> {
    Ok(SharedSecret::new(secret)?.mint(backend_id, TokenValidity::hours(hours_valid))?)
}

fn parse_addr(addr: &str) -> Result<SocketAddr, RelayBuilderError> {
    addr.parse()
        .map_err(|e| RelayBuilderError::Parse(format!("invalid address '{}': {}", addr, e)))
}

/// Builder over [`RelayConfig`]; both listeners default to ephemeral localhost ports
#[derive(Debug, Clone)]
pub struct RelayBuilder {
    config: RelayConfig,
    heartbeat: HeartbeatConfig,
}

impl RelayBuilder {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        let config = RelayConfig {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            jwt_secret: jwt_secret.into(),
            ..RelayConfig::default()
        };
        Self {
            config,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Start from a complete configuration
    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            config,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn http_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.config.http_addr = parse_addr(addr)?;
        Ok(self)
    }

    pub fn control_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.config.control_addr = parse_addr(addr)?;
        Ok(self)
    }

    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.config.public_url = url.into();
        self
    }

    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.tls_cert = Some(cert.into());
        self.config.tls_key = Some(key.into());
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period_secs = grace.as_secs();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn max_backends(mut self, max: usize) -> Self {
        self.config.max_backends = max;
        self
    }

    pub fn max_pending_per_backend(mut self, max: usize) -> Self {
        self.config.max_pending_per_backend = max;
        self
    }

    pub fn max_buffered_bytes_per_backend(mut self, max: usize) -> Self {
        self.config.max_buffered_bytes_per_backend = max;
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    /// Require a bearer token on public requests as well
    pub fn public_auth(mut self, enabled: bool) -> Self {
        self.config.public_auth = enabled;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind both listeners and serve in the background
    pub async fn start(self) -> Result<RunningRelay, RelayBuilderError> {
        let secret = SharedSecret::new(self.config.jwt_secret.clone())?;
        let server = RelayServer::bind_with_heartbeat(self.config, self.heartbeat).await?;

        let http_addr = server.http_addr();
        let control_addr = server.control_addr();
        let state = server.state();
        info!(http = %http_addr, control = %control_addr, "Relay started");

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        Ok(RunningRelay {
            http_addr,
            control_addr,
            state,
            secret,
            stop: Some(stop),
            task,
        })
    }
}

/// A relay serving on background tasks
pub struct RunningRelay {
    http_addr: SocketAddr,
    control_addr: SocketAddr,
    state: Arc<AppState>,
    secret: SharedSecret,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl RunningRelay {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Absolute URL of `path` on the public listener
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    pub fn token(&self, backend_id: &str) -> Result<String, RelayBuilderError> {
        Ok(self.secret.mint(backend_id, TokenValidity::hours(1))?)
    }

    /// Agent configuration pointing at this relay, with a freshly minted token
    ///
    /// The relay runs with a self-signed certificate unless one was set, so
    /// certificate verification is turned off.
    pub fn agent_config(
        &self,
        backend_id: &str,
        local_address: &str,
    ) -> Result<AgentConfig, RelayBuilderError> {
        Ok(AgentConfig {
            relay_addr: self.control_addr.to_string(),
            server_name: "localhost".to_string(),
            token: self.token(backend_id)?,
            backend_id: backend_id.to_string(),
            local_address: local_address.to_string(),
            insecure: self.state.config.tls_cert.is_none(),
            ..AgentConfig::default()
        })
    }

    /// Stop serving and close every control connection
    pub async fn shutdown(mut self) -> Result<(), RelayBuilderError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| RelayBuilderError::Task(e.to_string()))??;
        Ok(())
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
