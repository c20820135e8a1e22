//! QUIC connection implementation

use async_trait::async_trait;
use quinn::Connection;
use relay_transport::{ConnectionStats, TransportConnection, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::stream::QuicStream;

// Process-wide, never reused (quinn's stable_id may be recycled after drop)
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: u64,
    created_at: Instant,
    resumed: bool,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        Self::with_resumption(connection, false)
    }

    pub(crate) fn with_resumption(connection: Connection, resumed: bool) -> Self {
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            inner: connection,
            created_at: Instant::now(),
            resumed,
        }
    }

    /// Get the underlying quinn connection
    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    /// Whether this connection was established through 0-RTT resumption
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

        let stream = QuicStream::new(send, recv);
        trace!(
            connection_id = self.connection_id,
            stream_id = relay_transport::TransportStream::stream_id(&stream),
            "Opened bidirectional stream"
        );
        Ok(stream)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => Ok(Some(QuicStream::new(send, recv))),
            Err(
                quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::LocallyClosed,
            ) => {
                debug!(connection_id = self.connection_id, "Connection closed");
                Ok(None)
            }
            Err(e) => {
                warn!(connection_id = self.connection_id, "Connection lost: {}", e);
                Err(TransportError::ConnectionLost(e.to_string()))
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(
            connection_id = self.connection_id,
            "QUIC connection closed: {} (code: {})", reason, error_code
        );
    }

    async fn closed(&self) -> String {
        self.inner.closed().await.to_string()
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            datagrams_sent: quinn_stats.udp_tx.datagrams,
            datagrams_received: quinn_stats.udp_rx.datagrams,
            rtt_ms: Some(self.inner.rtt().as_millis() as u32),
            uptime_secs: self.created_at.elapsed().as_secs(),
            resumed: self.resumed,
        }
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}
