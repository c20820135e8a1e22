//! Tunnel relay - reach backends behind NAT through one public entry point
//!
//! Re-exports the workspace crates under one name and adds [`RelayBuilder`]
//! for running a relay inside another program.
//!
//! # Relay
//!
//! ```ignore
//! use tunnel_relay::RelayBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayBuilder::new(std::env::var("RELAY_JWT_SECRET")?)
//!         .http_addr("0.0.0.0:8080")?
//!         .control_addr("0.0.0.0:4443")?
//!         .start()
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Agent
//!
//! ```ignore
//! use tunnel_relay::{Agent, AgentConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::new(AgentConfig {
//!         relay_addr: "relay.example.com:4443".to_string(),
//!         server_name: "relay.example.com".to_string(),
//!         backend_id: "my-app".to_string(),
//!         token: std::env::var("RELAY_AGENT_TOKEN")?,
//!         local_address: "127.0.0.1:3000".to_string(),
//!         ..Default::default()
//!     })?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```

pub mod relay;

pub use relay::{generate_token, RelayBuilder, RelayBuilderError, RunningRelay};

// Agent side
pub use relay_agent::{
    Agent, AgentConfig, AgentError, Backoff, ConnectionState, ReconnectError, SessionTicketStore,
};

// Relay side
pub use relay_control::{BackendStatus, DuplicatePolicy, HeartbeatConfig, RegistryError};
pub use relay_server::{AppState, ProxyError, RelayConfig, RelayServer, ServerError};

// Wire protocol and transport
pub use relay_auth::{JwtError, SharedSecret};
pub use relay_proto::{ErrorCode, RelayMessage, PROTOCOL_VERSION};
pub use relay_transport_quic::{QuicConfig, QuicConnection, QuicConnector, QuicStream};
