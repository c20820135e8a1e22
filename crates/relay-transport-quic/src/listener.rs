//! QUIC listener and connector implementations

use async_trait::async_trait;
use quinn::Endpoint;
use relay_transport::{
    TransportConfig, TransportConnector, TransportError, TransportListener, TransportResult,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

/// QUIC listener for accepting incoming connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        loop {
            let Some(incoming) = self.endpoint.accept().await else {
                return Err(TransportError::ConnectionError(
                    "QUIC endpoint closed".to_string(),
                ));
            };

            let remote = incoming.remote_address();
            debug!("Incoming QUIC connection from {}", remote);

            match incoming.await {
                Ok(connection) => {
                    info!("QUIC connection established from {}", remote);
                    return Ok((QuicConnection::new(connection), remote));
                }
                Err(e) => {
                    warn!("Failed to establish QUIC connection from {}: {}", remote, e);
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for establishing outgoing connections
///
/// Owns one client endpoint for its whole life. The rustls session cache
/// lives in the endpoint's client config, so a reconnect to the same relay
/// can resume the TLS session and, when the relay allows it, use 0-RTT.
#[derive(Debug)]
pub struct QuicConnector {
    v4: Endpoint,
    v6: Option<Endpoint>,
    enable_0rtt: bool,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let client_config = config.build_client_config()?;

        let mut v4 = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(TransportError::IoError)?;
        v4.set_default_client_config(client_config.clone());

        // IPv6 may be unavailable on the host; only fail when actually needed
        let v6 = match Endpoint::client(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))) {
            Ok(mut endpoint) => {
                endpoint.set_default_client_config(client_config);
                Some(endpoint)
            }
            Err(e) => {
                debug!("IPv6 client endpoint unavailable: {}", e);
                None
            }
        };

        debug!("QUIC connector created");

        Ok(Self {
            v4,
            v6,
            enable_0rtt: config.enable_0rtt,
        })
    }

    fn endpoint_for(&self, addr: &SocketAddr) -> TransportResult<&Endpoint> {
        match addr {
            SocketAddr::V4(_) => Ok(&self.v4),
            SocketAddr::V6(_) => self.v6.as_ref().ok_or_else(|| {
                TransportError::ConnectionError("IPv6 is not available".to_string())
            }),
        }
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        let connecting = self
            .endpoint_for(&addr)?
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        if self.enable_0rtt {
            match connecting.into_0rtt() {
                Ok((connection, accepted)) => {
                    // Nothing is written before the handshake completes, so a
                    // rejected 0-RTT loses no data.
                    let resumed = accepted.await;
                    if connection.close_reason().is_some() {
                        return Err(TransportError::ConnectionError(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                    info!(
                        resumed,
                        "QUIC connection established to {} ({})", server_name, addr
                    );
                    return Ok(QuicConnection::with_resumption(connection, resumed));
                }
                Err(connecting) => {
                    let connection = connecting
                        .await
                        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
                    info!("QUIC connection established to {} ({})", server_name, addr);
                    return Ok(QuicConnection::new(connection));
                }
            }
        }

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection))
    }
}
