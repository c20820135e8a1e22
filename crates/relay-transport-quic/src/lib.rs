//! QUIC transport implementation using quinn
//!
//! QUIC gives the relay exactly what the control connection needs: many
//! independent ordered streams over one connection, with loss on one stream
//! never stalling another, keepalives, and TLS 1.3 session resumption so a
//! reconnecting agent skips the full handshake.
//!
//! # Example
//!
//! ```no_run
//! use relay_transport_quic::{QuicTransportFactory, QuicConfig};
//! use relay_transport::TransportFactory;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = QuicTransportFactory::new();
//!
//! // Relay side
//! let config = Arc::new(QuicConfig::server_self_signed(&[])?);
//! let listener = factory.create_listener("0.0.0.0:4443".parse()?, config)?;
//!
//! // Agent side
//! let config = Arc::new(QuicConfig::client_insecure());
//! let connector = factory.create_connector(config)?;
//! # Ok(())
//! # }
//! ```

// Initialize rustls crypto provider once globally
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::{QuicConfig, TlsMaterial};
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::{QuicRecvHalf, QuicSendHalf, QuicStream};

use relay_transport::{TransportFactory, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// QUIC transport factory
#[derive(Debug, Default)]
pub struct QuicTransportFactory;

impl QuicTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for QuicTransportFactory {
    type Listener = QuicListener;
    type Connector = QuicConnector;
    type Config = QuicConfig;

    fn create_listener(
        &self,
        bind_addr: SocketAddr,
        config: Arc<Self::Config>,
    ) -> TransportResult<Self::Listener> {
        QuicListener::new(bind_addr, config)
    }

    fn create_connector(&self, config: Arc<Self::Config>) -> TransportResult<Self::Connector> {
        QuicConnector::new(config)
    }

    fn name(&self) -> &str {
        "QUIC"
    }
}
