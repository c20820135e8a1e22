//! Agent configuration: defaults, optional YAML file, then flags and env

use clap::Args;
use serde::{Deserialize, Serialize};
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

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Relay control address (host:port)
    pub relay_addr: String,
    /// TLS server name of the relay
    pub server_name: String,
    pub token: String,
    pub backend_id: String,
    /// Local service every exchange is forwarded to (host:port)
    pub local_address: String,
    pub max_backoff_secs: u64,
    /// Failed connection attempts in a row before giving up, counting the
    /// first one after start or after a lost connection. 0 means retry forever.
    pub max_attempts: u32,
    pub session_ticket_path: PathBuf,
    /// Skip relay certificate verification
    pub insecure: bool,
    pub ping_interval_secs: u64,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_addr: "localhost:4443".to_string(),
            server_name: "localhost".to_string(),
            token: String::new(),
            backend_id: String::new(),
            local_address: "127.0.0.1:3000".to_string(),
            max_backoff_secs: 30,
            max_attempts: 0,
            session_ticket_path: PathBuf::from("./session.ticket"),
            insecure: false,
            ping_interval_secs: 20,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
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

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_id.is_empty() {
            return Err(ConfigError::Missing("backend_id"));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        if self.relay_addr.is_empty() {
            return Err(ConfigError::Missing("relay_addr"));
        }
        if !self.local_address.contains(':') {
            return Err(ConfigError::Invalid {
                field: "local_address",
                reason: format!("'{}' is not host:port", self.local_address),
            });
        }
        if self.max_backoff_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "max_backoff_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "ping_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Command-line and environment overrides, applied on top of the file
#[derive(Debug, Clone, Default, Args)]
pub struct AgentOverrides {
    /// Relay control address (host:port)
    #[arg(short, long, env = "RELAY_AGENT_RELAY_ADDR")]
    pub relay_addr: Option<String>,

    /// TLS server name of the relay
    #[arg(long, env = "RELAY_AGENT_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Backend token minted by the relay operator
    #[arg(short, long, env = "RELAY_AGENT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Backend id to register under
    #[arg(short, long, env = "RELAY_AGENT_BACKEND_ID")]
    pub backend_id: Option<String>,

    /// Local service address (host:port)
    #[arg(short, long, env = "RELAY_AGENT_LOCAL_ADDRESS")]
    pub local_address: Option<String>,

    #[arg(long, env = "RELAY_AGENT_MAX_BACKOFF_SECS")]
    pub max_backoff_secs: Option<u64>,

    /// Give up after this many failed attempts (0 = never)
    #[arg(long, env = "RELAY_AGENT_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "RELAY_AGENT_SESSION_TICKET_PATH")]
    pub session_ticket_path: Option<PathBuf>,

    /// Skip relay certificate verification (development only)
    #[arg(long, env = "RELAY_AGENT_INSECURE")]
    pub insecure: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_AGENT_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl AgentOverrides {
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(v) = self.relay_addr {
            config.relay_addr = v;
        }
        if let Some(v) = self.server_name {
            config.server_name = v;
        }
        if let Some(v) = self.token {
            config.token = v;
        }
        if let Some(v) = self.backend_id {
            config.backend_id = v;
        }
        if let Some(v) = self.local_address {
            config.local_address = v;
        }
        if let Some(v) = self.max_backoff_secs {
            config.max_backoff_secs = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.session_ticket_path {
            config.session_ticket_path = v;
        }
        if let Some(v) = self.insecure {
            config.insecure = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
    }
}
