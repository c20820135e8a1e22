//! Local forwarding: one relay-opened stream, one call to the local service

pub mod http;
pub mod websocket;

use relay_proto::RelayMessage;
use relay_transport::{TransportError, TransportStream};
use relay_transport_quic::QuicStream;
use thiserror::Error;
use tracing::{debug, warn};

pub use http::HttpForwarder;

/// Stream reset/stop code telling the peer the exchange was abandoned
pub const CANCELLED: u32 = 1;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Local service error: {0}")]
    Local(String),

    #[error("Invalid request from relay: {0}")]
    InvalidRequest(String),

    #[error("Unexpected {0} as first message on a data stream")]
    UnexpectedMessage(&'static str),
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    http: HttpForwarder,
    local_address: String,
}

impl Forwarder {
    pub fn new(local_address: impl Into<String>) -> Result<Self, ForwardError> {
        let local_address = local_address.into();
        Ok(Self {
            http: HttpForwarder::new(&local_address)?,
            local_address,
        })
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Serve one relay-opened stream, dispatching on its first message
    pub async fn handle_stream(&self, mut stream: QuicStream) -> Result<(), ForwardError> {
        let stream_id = stream.stream_id();
        match stream.recv_message().await? {
            Some(RelayMessage::HttpRequest {
                method,
                path,
                headers,
                body,
                streaming,
            }) => {
                debug!(stream_id, method = %method, path = %path, "HTTP request");
                self.http
                    .forward(
                        http::LocalRequest {
                            method,
                            path,
                            headers,
                            body,
                            streaming,
                        },
                        stream,
                    )
                    .await
            }
            Some(RelayMessage::WsOpen {
                path,
                headers,
                protocols,
            }) => {
                debug!(stream_id, path = %path, "WebSocket open");
                websocket::forward(&self.local_address, path, headers, protocols, stream).await
            }
            Some(other) => {
                warn!(stream_id, kind = other.kind(), "Unexpected first message on data stream");
                stream.reset(CANCELLED);
                Err(ForwardError::UnexpectedMessage(other.kind()))
            }
            None => Ok(()),
        }
    }
}
