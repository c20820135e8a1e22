//! Relay configuration
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! environment variables and command-line flags (`RelayOverrides`).

use clap::Args;
use relay_auth::MIN_SECRET_LEN;
use relay_control::{DuplicatePolicy, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("jwt_secret is required")]
    MissingSecret,

    #[error("jwt_secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,

    #[error("tls_cert and tls_key must be given together")]
    IncompleteTls,

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Public HTTP/WebSocket listener
    pub http_addr: SocketAddr,
    /// QUIC listener for backend control connections
    pub control_addr: SocketAddr,
    /// Base URL reported to backends in `Registered`
    pub public_url: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub jwt_secret: String,
    pub grace_period_secs: u64,
    pub request_timeout_secs: u64,
    pub max_backends: usize,
    pub max_pending_per_backend: usize,
    pub max_buffered_bytes_per_backend: usize,
    pub duplicate_policy: DuplicatePolicy,
    /// Require a bearer token on public requests
    pub public_auth: bool,
    pub ws_open_timeout_secs: u64,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            control_addr: SocketAddr::from(([0, 0, 0, 0], 4443)),
            public_url: "http://localhost:8080".to_string(),
            tls_cert: None,
            tls_key: None,
            jwt_secret: String::new(),
            grace_period_secs: 30,
            request_timeout_secs: 60,
            max_backends: 100,
            max_pending_per_backend: 1000,
            max_buffered_bytes_per_backend: 64 * 1024 * 1024,
            duplicate_policy: DuplicatePolicy::Supersede,
            public_auth: false,
            ws_open_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, overlaid by `path` when given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        let positive = [
            ("grace_period_secs", self.grace_period_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("ws_open_timeout_secs", self.ws_open_timeout_secs),
            ("max_backends", self.max_backends as u64),
            ("max_pending_per_backend", self.max_pending_per_backend as u64),
            (
                "max_buffered_bytes_per_backend",
                self.max_buffered_bytes_per_backend as u64,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !self.public_url.starts_with("http://") && !self.public_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "public_url",
                reason: format!("'{}' is not an http(s) URL", self.public_url),
            });
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ws_open_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_open_timeout_secs)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            grace_period: self.grace_period(),
            max_backends: self.max_backends,
            duplicate_policy: self.duplicate_policy,
        }
    }
}

/// Command-line and environment overrides, applied on top of the file
#[derive(Debug, Clone, Default, Args)]
pub struct RelayOverrides {
    /// Public HTTP listen address
    #[arg(long, env = "RELAY_HTTP_ADDR")]
    pub http_addr: Option<SocketAddr>,

    /// QUIC control listen address
    #[arg(long, env = "RELAY_CONTROL_ADDR")]
    pub control_addr: Option<SocketAddr>,

    /// Public base URL reported to backends
    #[arg(long, env = "RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// TLS certificate (PEM) for the control listener
    #[arg(long, env = "RELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM) for the control listener
    #[arg(long, env = "RELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Shared secret used to verify backend tokens
    #[arg(long, env = "RELAY_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Seconds a lost backend is held for reconnection
    #[arg(long, env = "RELAY_GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,

    /// Seconds before a proxied request gets 504
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "RELAY_MAX_BACKENDS")]
    pub max_backends: Option<usize>,

    #[arg(long, env = "RELAY_MAX_PENDING_PER_BACKEND")]
    pub max_pending_per_backend: Option<usize>,

    #[arg(long, env = "RELAY_MAX_BUFFERED_BYTES_PER_BACKEND")]
    pub max_buffered_bytes_per_backend: Option<usize>,

    /// reject | supersede
    #[arg(long, env = "RELAY_DUPLICATE_POLICY")]
    pub duplicate_policy: Option<DuplicatePolicy>,

    /// Require a bearer token on public requests
    #[arg(long, env = "RELAY_PUBLIC_AUTH")]
    pub public_auth: Option<bool>,

    #[arg(long, env = "RELAY_WS_OPEN_TIMEOUT_SECS")]
    pub ws_open_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl RelayOverrides {
    pub fn apply(self, config: &mut RelayConfig) {
        if let Some(v) = self.http_addr {
            config.http_addr = v;
        }
        if let Some(v) = self.control_addr {
            config.control_addr = v;
        }
        if let Some(v) = self.public_url {
            config.public_url = v;
        }
        if let Some(v) = self.tls_cert {
            config.tls_cert = Some(v);
        }
        if let Some(v) = self.tls_key {
            config.tls_key = Some(v);
        }
        if let Some(v) = self.jwt_secret {
            config.jwt_secret = v;
        }
        if let Some(v) = self.grace_period_secs {
            config.grace_period_secs = v;
        }
        if let Some(v) = self.request_timeout_secs {
            config.request_timeout_secs = v;
        }
        if let Some(v) = self.max_backends {
            config.max_backends = v;
        }
        if let Some(v) = self.max_pending_per_backend {
            config.max_pending_per_backend = v;
        }
        if let Some(v) = self.max_buffered_bytes_per_backend {
            config.max_buffered_bytes_per_backend = v;
        }
        if let Some(v) = self.duplicate_policy {
            config.duplicate_policy = v;
        }
        if let Some(v) = self.public_auth {
            config.public_auth = v;
        }
        if let Some(v) = self.ws_open_timeout_secs {
            config.ws_open_timeout_secs = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
    }
}
