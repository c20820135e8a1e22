//! Transport abstraction layer for relay connections
//!
//! The relay and the agent talk over one long-lived connection carrying many
//! independent ordered streams. This crate names the capabilities the rest of
//! the system relies on, without tying it to a concrete protocol:
//!
//! - in-order delivery within a stream, no head-of-line blocking across streams
//! - connection-level keepalive
//! - resumption of prior session state on reconnect
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   relay-control / relay-server / relay-agent │
//! └──────────────────────────────────────────────┘
//!                      │ uses traits
//!                      ↓
//! ┌──────────────────────────────────────────────┐
//! │          relay-transport (this crate)        │
//! │  TransportListener   TransportConnection     │
//! │  TransportConnector  TransportStream         │
//! └──────────────────────────────────────────────┘
//!                      │ implemented by
//!                      ↓
//! ┌──────────────────────────────────────────────┐
//! │            relay-transport-quic              │
//! └──────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use relay_proto::RelayMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream reset by peer (code {0})")]
    StreamReset(u64),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// Whether the error means the whole connection is gone, as opposed to a
    /// single stream failing
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::ConnectionError(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional stream over a transport connection
///
/// One stream carries exactly one logical exchange (or the control channel).
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send a relay message on this stream
    async fn send_message(&mut self, message: &RelayMessage) -> TransportResult<()>;

    /// Receive a relay message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Abort both directions, signalling `code` to the peer
    fn reset(&mut self, code: u32);

    /// Get the stream ID (unique within this connection)
    fn stream_id(&self) -> u64;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;
}

/// A transport connection that can create multiple streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    ///
    /// # Arguments
    /// * `error_code` - Application-specific error code (0 for normal closure)
    /// * `reason` - Human-readable reason for closure
    async fn close(&self, error_code: u32, reason: &str);

    /// Resolves once the connection is closed, for whatever reason
    async fn closed(&self) -> String;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Stable identifier for this connection, unique within the process
    fn connection_id(&self) -> u64;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of UDP datagrams sent
    pub datagrams_sent: u64,

    /// Number of UDP datagrams received
    pub datagrams_received: u64,

    /// Round-trip time estimate (milliseconds)
    pub rtt_ms: Option<u32>,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,

    /// Whether the handshake resumed an earlier TLS session
    pub resumed: bool,
}

/// Server-side: Listens for incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type accepted by this listener
    type Connection: TransportConnection;

    /// Accept an incoming connection
    ///
    /// Returns the connection and the remote address of the connecting peer.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the listener (stop accepting new connections)
    async fn close(&self);
}

/// Client-side: Establishes outgoing transport connections
///
/// A connector is long-lived: implementations keep session state between
/// `connect` calls so a reconnect can skip the full handshake.
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// # Arguments
    /// * `addr` - The socket address to connect to
    /// * `server_name` - The server name for TLS verification
    async fn connect(&self, addr: SocketAddr, server_name: &str)
        -> TransportResult<Self::Connection>;
}

/// Configuration for transport security
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates in DER form (if not using webpki roots)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

/// ALPN identifier of the relay protocol
pub const RELAY_ALPN: &str = "relay-tunnel/1";

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec![RELAY_ALPN.to_string()],
        }
    }
}

/// Transport-specific configuration
pub trait TransportConfig: Send + Sync + Debug {
    /// Get the security configuration
    fn security_config(&self) -> &TransportSecurityConfig;

    /// Validate the configuration
    fn validate(&self) -> TransportResult<()>;
}

/// Factory for creating transport listeners and connectors
pub trait TransportFactory: Send + Sync + Debug {
    /// The listener type created by this factory
    type Listener: TransportListener;

    /// The connector type created by this factory
    type Connector: TransportConnector;

    /// The configuration type for this transport
    type Config: TransportConfig;

    /// Create a new listener bound to the given address
    fn create_listener(
        &self,
        bind_addr: SocketAddr,
        config: Arc<Self::Config>,
    ) -> TransportResult<Self::Listener>;

    /// Create a new connector
    fn create_connector(&self, config: Arc<Self::Config>) -> TransportResult<Self::Connector>;

    /// Human-readable name for this transport
    fn name(&self) -> &str;
}
