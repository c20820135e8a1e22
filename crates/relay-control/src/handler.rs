//! Control connection handler
//!
//! Runs one backend control connection from the first message on stream 0
//! to its end: registration or resume, the heartbeat loop, and the registry
//! update when the connection goes away.

use crate::registry::{BackendRegistry, Registration, RegistryError};
use relay_proto::{ErrorCode, RelayMessage, CONTROL_STREAM_ID, PROTOCOL_VERSION};
use relay_transport::{TransportConnection, TransportStream};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// QUIC application close codes used on control connections
pub mod close_code {
    pub const NORMAL: u32 = 0;
    pub const REJECTED: u32 = 1;
    pub const HEARTBEAT_TIMEOUT: u32 = 2;
    pub const PROTOCOL_VIOLATION: u32 = 3;
    pub const SUPERSEDED: u32 = 4;
}

/// Unexpected or malformed control messages tolerated before the connection is dropped
const MAX_PROTOCOL_VIOLATIONS: u32 = 3;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Time allowed between connect and a successful registration
    pub handshake_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// How a registered session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// The agent sent `Disconnect`
    Unregistered(String),
    /// Transport loss, heartbeat timeout or too many bad messages
    Lost(String),
}

pub struct ControlHandler<C: TransportConnection> {
    registry: BackendRegistry<Arc<C>>,
    public_url: String,
    heartbeat: HeartbeatConfig,
}

impl<C: TransportConnection> Clone for ControlHandler<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            public_url: self.public_url.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn valid_backend_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn error_code_for(e: &RegistryError) -> ErrorCode {
    match e {
        RegistryError::Auth(_) => ErrorCode::AuthFailed,
        RegistryError::Duplicate(_) => ErrorCode::DuplicateBackend,
        RegistryError::LimitReached(_) => ErrorCode::LimitReached,
        RegistryError::NotFound(_) | RegistryError::TicketMismatch(_) => {
            ErrorCode::ReconnectFailed
        }
        RegistryError::Unavailable(_) | RegistryError::Timeout(_) => {
            ErrorCode::RegistrationFailed
        }
    }
}

impl<C> ControlHandler<C>
where
    C: TransportConnection + 'static,
{
    pub fn new(
        registry: BackendRegistry<Arc<C>>,
        public_url: impl Into<String>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            registry,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            heartbeat,
        }
    }

    pub fn registry(&self) -> &BackendRegistry<Arc<C>> {
        &self.registry
    }

    /// Public URL under which a backend is reachable
    pub fn public_url_for(&self, backend_id: &str) -> String {
        format!("{}/relay/{}", self.public_url, backend_id)
    }

    /// Serve one control connection until it ends
    pub async fn handle_connection(&self, connection: Arc<C>) {
        let connection_id = connection.connection_id();
        let remote = connection.remote_address();
        debug!(connection_id, remote = %remote, "New control connection");

        let mut control = match timeout(self.heartbeat.handshake_timeout, connection.accept_stream())
            .await
        {
            Ok(Ok(Some(stream))) => stream,
            Ok(Ok(None)) => {
                debug!(connection_id, "Connection closed before opening a control stream");
                return;
            }
            Ok(Err(e)) => {
                warn!(connection_id, error = %e, "Failed to accept control stream");
                return;
            }
            Err(_) => {
                warn!(connection_id, remote = %remote, "No control stream within handshake timeout");
                connection
                    .close(close_code::REJECTED, "handshake timeout")
                    .await;
                return;
            }
        };

        if control.stream_id() != CONTROL_STREAM_ID {
            warn!(
                connection_id,
                stream_id = control.stream_id(),
                "First stream is not the control stream"
            );
            self.reject(
                &connection,
                &mut control,
                ErrorCode::InvalidMessage,
                "control messages must use stream 0".to_string(),
            )
            .await;
            return;
        }

        let (backend_id, registration) = match self.handshake(&connection, &mut control).await {
            Ok(accepted) => accepted,
            Err((code, message)) => {
                warn!(connection_id, remote = %remote, code = %code, "Registration refused: {}", message);
                self.reject(&connection, &mut control, code, message).await;
                return;
            }
        };

        if let Some(previous) = registration.superseded {
            info!(
                backend_id = %backend_id,
                old_connection_id = previous.connection_id(),
                "Closing superseded control connection"
            );
            previous.close(close_code::SUPERSEDED, "superseded").await;
        }

        let reply = RelayMessage::Registered {
            backend_id: backend_id.clone(),
            public_url: self.public_url_for(&backend_id),
            session_ticket: registration.ticket.to_vec(),
            resumed: registration.resumed,
        };
        if let Err(e) = control.send_message(&reply).await {
            error!(backend_id = %backend_id, error = %e, "Failed to send Registered");
            self.registry.mark_reconnecting(&backend_id, connection_id);
            return;
        }

        info!(
            backend_id = %backend_id,
            connection_id,
            resumed = registration.resumed,
            remote = %remote,
            "Control session established"
        );

        match self.run_session(&backend_id, &mut control).await {
            SessionEnd::Unregistered(reason) => {
                info!(backend_id = %backend_id, reason = %reason, "Backend unregistered");
                self.registry.unregister(&backend_id, connection_id);
                let _ = control.finish().await;
                connection.close(close_code::NORMAL, "disconnect").await;
            }
            SessionEnd::Lost(reason) => {
                warn!(backend_id = %backend_id, connection_id, reason = %reason, "Control connection lost");
                self.registry.mark_reconnecting(&backend_id, connection_id);
                if !connection.is_closed() {
                    let code = if reason.contains("violation") {
                        close_code::PROTOCOL_VIOLATION
                    } else {
                        close_code::HEARTBEAT_TIMEOUT
                    };
                    connection.close(code, &reason).await;
                }
            }
        }
    }

    /// Read `Register`/`Reconnect` until the backend is accepted or refused
    async fn handshake(
        &self,
        connection: &Arc<C>,
        control: &mut C::Stream,
    ) -> Result<(String, Registration<Arc<C>>), (ErrorCode, String)> {
        let connection_id = connection.connection_id();
        let deadline = Instant::now() + self.heartbeat.handshake_timeout;
        let mut resume_refused = false;

        loop {
            let message = match tokio::time::timeout_at(deadline, control.recv_message()).await {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    return Err((
                        ErrorCode::InvalidMessage,
                        "control stream closed before registration".to_string(),
                    ))
                }
                Ok(Err(e)) => {
                    return Err((
                        ErrorCode::InvalidMessage,
                        format!("malformed registration: {}", e),
                    ))
                }
                Err(_) => {
                    return Err((
                        ErrorCode::RegistrationFailed,
                        "registration timed out".to_string(),
                    ))
                }
            };

            match message {
                RelayMessage::Register {
                    backend_id,
                    token,
                    protocol_version,
                } => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err((
                            ErrorCode::UnsupportedVersion,
                            format!(
                                "protocol version {} is not supported (expected {})",
                                protocol_version, PROTOCOL_VERSION
                            ),
                        ));
                    }
                    if !valid_backend_id(&backend_id) {
                        return Err((
                            ErrorCode::InvalidMessage,
                            format!("invalid backend id '{}'", backend_id),
                        ));
                    }
                    debug!(backend_id = %backend_id, connection_id, "Register received");
                    return self
                        .registry
                        .register(&backend_id, connection.clone(), connection_id, &token)
                        .map(|registration| (backend_id, registration))
                        .map_err(|e| (error_code_for(&e), e.to_string()));
                }
                RelayMessage::Reconnect {
                    backend_id,
                    token,
                    session_ticket,
                } if !resume_refused => {
                    debug!(backend_id = %backend_id, connection_id, "Reconnect received");
                    match self.registry.resume(
                        &backend_id,
                        connection.clone(),
                        connection_id,
                        &token,
                        &session_ticket,
                    ) {
                        Ok(registration) => return Ok((backend_id, registration)),
                        Err(e @ (RegistryError::NotFound(_) | RegistryError::TicketMismatch(_))) => {
                            info!(backend_id = %backend_id, error = %e, "Resume refused, expecting full registration");
                            resume_refused = true;
                            control
                                .send_message(&RelayMessage::error(
                                    ErrorCode::ReconnectFailed,
                                    e.to_string(),
                                ))
                                .await
                                .map_err(|e| (ErrorCode::ReconnectFailed, e.to_string()))?;
                        }
                        Err(e) => return Err((error_code_for(&e), e.to_string())),
                    }
                }
                other => {
                    return Err((
                        ErrorCode::InvalidMessage,
                        format!("expected register, got {}", other.kind()),
                    ))
                }
            }
        }
    }

    async fn reject(
        &self,
        connection: &Arc<C>,
        control: &mut C::Stream,
        code: ErrorCode,
        message: String,
    ) {
        let _ = control
            .send_message(&RelayMessage::error(code, message.clone()))
            .await;
        let _ = control.finish().await;
        // Let the error frame flush before tearing down the connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        connection.close(close_code::REJECTED, &message).await;
    }

    /// Heartbeat loop on the control stream
    async fn run_session(&self, backend_id: &str, control: &mut C::Stream) -> SessionEnd {
        let mut interval = tokio::time::interval(self.heartbeat.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately
        interval.tick().await;

        let mut waiting_for_pong = false;
        let mut pong_deadline = Instant::now();
        let mut violations = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick(), if !waiting_for_pong => {
                    debug!(backend_id = %backend_id, "Sending ping");
                    if let Err(e) = control.send_message(&RelayMessage::Ping { timestamp: now_millis() }).await {
                        return SessionEnd::Lost(format!("ping failed: {}", e));
                    }
                    waiting_for_pong = true;
                    pong_deadline = Instant::now() + self.heartbeat.pong_timeout;
                }

                _ = tokio::time::sleep_until(pong_deadline), if waiting_for_pong => {
                    return SessionEnd::Lost(format!(
                        "no pong within {}s",
                        self.heartbeat.pong_timeout.as_secs()
                    ));
                }

                result = control.recv_message() => {
                    match result {
                        Ok(Some(RelayMessage::Ping { timestamp })) => {
                            if let Err(e) = control.send_message(&RelayMessage::Pong { timestamp }).await {
                                return SessionEnd::Lost(format!("pong failed: {}", e));
                            }
                        }
                        Ok(Some(RelayMessage::Pong { timestamp })) => {
                            debug!(
                                backend_id = %backend_id,
                                rtt_ms = now_millis().saturating_sub(timestamp),
                                "Received pong"
                            );
                            waiting_for_pong = false;
                        }
                        Ok(Some(RelayMessage::Disconnect { reason })) => {
                            return SessionEnd::Unregistered(reason);
                        }
                        Ok(None) => {
                            return SessionEnd::Lost("control stream closed".to_string());
                        }
                        Err(e) if e.is_connection_loss() => {
                            return SessionEnd::Lost(e.to_string());
                        }
                        Err(e) => {
                            violations += 1;
                            warn!(backend_id = %backend_id, violations, error = %e, "Bad message on control stream");
                            if violations >= MAX_PROTOCOL_VIOLATIONS {
                                return SessionEnd::Lost("repeated protocol violations".to_string());
                            }
                        }
                        Ok(Some(msg)) => {
                            violations += 1;
                            warn!(backend_id = %backend_id, kind = msg.kind(), violations, "Unexpected message on control stream");
                            if violations >= MAX_PROTOCOL_VIOLATIONS {
                                return SessionEnd::Lost("repeated protocol violations".to_string());
                            }
                        }
                    }
                }
            }
        }
    }
}
