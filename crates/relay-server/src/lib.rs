//! Public side of the relay
//!
//! Serves `/relay/{backend_id}/...` over HTTP and WebSocket, forwarding each
//! exchange over a fresh stream on the backend's QUIC control connection,
//! and accepts those control connections on a separate QUIC listener.

pub mod config;
pub mod proxy;
pub mod server;
pub mod state;

pub use config::{ConfigError, RelayConfig, RelayOverrides};
pub use proxy::ProxyError;
pub use server::{RelayServer, ServerError};
pub use state::AppState;
