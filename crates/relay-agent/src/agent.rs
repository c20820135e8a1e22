//! The agent's connection loop
//!
//! [`Agent::run`] drives the reconnection state machine: every `Connect`
//! effect opens a fresh QUIC connection, registers (or resumes with the
//! stored ticket) on stream 0 and then serves relay-opened streams until
//! the connection ends. Whatever ended it becomes the next event.

use crate::config::{AgentConfig, ConfigError};
use crate::forwarder::{ForwardError, Forwarder};
use crate::reconnect::{transition, Backoff, ConnectionState, Effect, Event, ReconnectError};
use crate::ticket::{SessionTicketStore, TicketError};
use relay_proto::{ErrorCode, RelayMessage, PROTOCOL_VERSION};
use relay_transport::{TransportConnection, TransportConnector, TransportError, TransportStream};
use relay_transport_quic::{QuicConfig, QuicConnection, QuicConnector, QuicStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Time allowed from connect until `Registered`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the relay gets to acknowledge a `Disconnect` by closing
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for [`Agent::shutdown`]
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay rejected registration ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Forwarding error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Session ticket error: {0}")]
    Ticket(#[from] TicketError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cannot resolve relay address {0}")]
    Resolve(String),

    #[error("Registration timed out")]
    Timeout,

    #[error("Connection superseded by a newer registration of this backend")]
    Superseded,
}

impl AgentError {
    /// Whether retrying with the same configuration cannot succeed
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Rejected { code, .. } => code.is_fatal(),
            AgentError::Config(_) | AgentError::Superseded => true,
            _ => false,
        }
    }
}

/// A registered control connection
struct Session {
    connection: Arc<QuicConnection>,
    control: QuicStream,
    resumed: bool,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
    Superseded,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn end_for_close_reason(reason: String) -> SessionEnd {
    if reason.contains("superseded") {
        SessionEnd::Superseded
    } else {
        SessionEnd::Lost(reason)
    }
}

pub struct Agent {
    config: AgentConfig,
    connector: QuicConnector,
    tickets: SessionTicketStore,
    forwarder: Forwarder,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    public_url: Mutex<Option<String>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let quic = if config.insecure {
            warn!("Relay certificate verification is disabled");
            QuicConfig::client_insecure()
        } else {
            QuicConfig::client_default()
        };
        let connector = QuicConnector::new(Arc::new(quic))?;
        let tickets = SessionTicketStore::new(&config.session_ticket_path, &config.backend_id);
        let forwarder = Forwarder::new(config.local_address.clone())?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            connector,
            tickets,
            forwarder,
            state,
            shutdown,
            public_url: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Watch connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Public URL from the latest `Registered`
    pub fn public_url(&self) -> Option<String> {
        self.public_url.lock().ok().and_then(|url| url.clone())
    }

    /// Ask [`Agent::run`] to disconnect and return, and wait until it did
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.state.subscribe();
        if timeout(SHUTDOWN_TIMEOUT, state.wait_for(ConnectionState::is_final))
            .await
            .is_err()
        {
            warn!("Agent did not stop within {}s", SHUTDOWN_TIMEOUT.as_secs());
        }
    }

    async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|requested| *requested).await;
    }

    fn step(
        &self,
        state: &mut ConnectionState,
        event: Event,
        backoff: &mut Backoff,
    ) -> Vec<Effect> {
        let (next, effects) = transition(state, event, backoff);
        if next != *state {
            debug!(from = ?state, to = ?next, "Connection state changed");
            *state = next;
            self.state.send_replace(state.clone());
        }
        effects
    }

    /// Keep the backend registered until shutdown or a final failure
    ///
    /// Returns `Ok` after [`Agent::shutdown`]. A refusal that retrying cannot
    /// fix, or running out of attempts, ends with an error.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.max_backoff(), self.config.max_attempts());
        let mut state = ConnectionState::Disconnected;
        let mut attempts = 0u32;
        let mut last_error: Option<AgentError> = None;

        let mut queue: VecDeque<Effect> = self.step(&mut state, Event::Start, &mut backoff).into();

        while let Some(effect) = queue.pop_front() {
            let event = match effect {
                Effect::Stop => break,
                Effect::ResetBackoff => {
                    backoff.reset();
                    None
                }
                Effect::ReportReconnecting => {
                    warn!(
                        backend_id = %self.config.backend_id,
                        attempt = backoff.attempt(),
                        "Relay connection lost, reconnecting"
                    );
                    None
                }
                Effect::Wait(delay) => {
                    info!("Retrying in {:.1}s", delay.as_secs_f64());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => None,
                        _ = self.shutdown_requested() => Some(Event::Shutdown),
                    }
                }
                Effect::Connect => {
                    attempts += 1;
                    let outcome = tokio::select! {
                        outcome = self.attempt() => Some(outcome),
                        _ = self.shutdown_requested() => None,
                    };
                    match outcome {
                        None => Some(Event::Shutdown),
                        Some(Ok(session)) => {
                            let resumed = session.resumed;
                            for effect in self.step(&mut state, Event::Connected { resumed }, &mut backoff) {
                                if effect == Effect::ResetBackoff {
                                    backoff.reset();
                                }
                            }
                            attempts = 0;
                            Some(match self.run_session(session).await {
                                SessionEnd::Shutdown => Event::Shutdown,
                                SessionEnd::Lost(reason) => {
                                    last_error = Some(AgentError::Transport(
                                        TransportError::ConnectionLost(reason),
                                    ));
                                    Event::ConnectionLost
                                }
                                SessionEnd::Superseded => {
                                    warn!(
                                        backend_id = %self.config.backend_id,
                                        "Another agent took over this backend id"
                                    );
                                    last_error = Some(AgentError::Superseded);
                                    Event::AttemptFailed { fatal: true }
                                }
                            })
                        }
                        Some(Err(e)) => {
                            let fatal = e.is_fatal();
                            if fatal {
                                error!(backend_id = %self.config.backend_id, error = %e, "Registration refused");
                            } else {
                                warn!(backend_id = %self.config.backend_id, attempt = attempts, error = %e, "Connection attempt failed");
                            }
                            last_error = Some(e);
                            Some(Event::AttemptFailed { fatal })
                        }
                    }
                }
            };

            if let Some(event) = event {
                queue.clear();
                queue.extend(self.step(&mut state, event, &mut backoff));
            }
        }

        if let Ok(mut url) = self.public_url.lock() {
            *url = None;
        }

        if state == ConnectionState::Stopped {
            info!(backend_id = %self.config.backend_id, "Agent stopped");
            return Ok(());
        }

        Err(match last_error {
            Some(e) if e.is_fatal() => ReconnectError::Refused(e.to_string()).into(),
            last => ReconnectError::GaveUp {
                attempts,
                last_error: last
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt made".to_string()),
            }
            .into(),
        })
    }

    /// Connect and register, resuming when a ticket is stored
    async fn attempt(&self) -> Result<Session, AgentError> {
        let addr = tokio::net::lookup_host(&self.config.relay_addr)
            .await
            .map_err(|e| AgentError::Resolve(format!("{}: {}", self.config.relay_addr, e)))?
            .next()
            .ok_or_else(|| AgentError::Resolve(self.config.relay_addr.clone()))?;

        let connection = Arc::new(
            self.connector
                .connect(addr, &self.config.server_name)
                .await?,
        );
        let mut control = connection.open_stream().await?;

        match timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut control)).await {
            Ok(Ok(resumed)) => Ok(Session {
                connection,
                control,
                resumed,
            }),
            Ok(Err(e)) => {
                connection.close(0, "registration failed").await;
                Err(e)
            }
            Err(_) => {
                connection.close(0, "registration timed out").await;
                Err(AgentError::Timeout)
            }
        }
    }

    async fn handshake(&self, control: &mut QuicStream) -> Result<bool, AgentError> {
        let register = RelayMessage::Register {
            backend_id: self.config.backend_id.clone(),
            token: self.config.token.clone(),
            protocol_version: PROTOCOL_VERSION,
        };

        // A ticket is only ever presented once
        let ticket = match self.tickets.take().await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(error = %e, "Cannot read session ticket, registering afresh");
                None
            }
        };

        let mut resuming = ticket.is_some();
        match ticket {
            Some(stored) => {
                debug!(issued_at = %stored.issued_at, "Resuming with session ticket");
                control
                    .send_message(&RelayMessage::Reconnect {
                        backend_id: self.config.backend_id.clone(),
                        token: self.config.token.clone(),
                        session_ticket: stored.ticket,
                    })
                    .await?;
            }
            None => control.send_message(&register).await?,
        }

        loop {
            match control.recv_message().await? {
                Some(RelayMessage::Registered {
                    public_url,
                    session_ticket,
                    resumed,
                    ..
                }) => {
                    if let Err(e) = self.tickets.save(&session_ticket).await {
                        warn!(error = %e, "Failed to persist session ticket");
                    }
                    info!(
                        backend_id = %self.config.backend_id,
                        public_url = %public_url,
                        resumed,
                        "Registered with relay"
                    );
                    if let Ok(mut url) = self.public_url.lock() {
                        *url = Some(public_url);
                    }
                    return Ok(resumed);
                }
                Some(RelayMessage::Error {
                    code: ErrorCode::ReconnectFailed,
                    message,
                }) if resuming => {
                    info!(reason = %message, "Session ticket refused, registering afresh");
                    resuming = false;
                    control.send_message(&register).await?;
                }
                Some(RelayMessage::Error { code, message }) => {
                    return Err(AgentError::Rejected { code, message });
                }
                Some(other) => {
                    return Err(AgentError::Protocol(format!(
                        "expected registered, got {}",
                        other.kind()
                    )));
                }
                None => {
                    return Err(AgentError::Protocol(
                        "relay closed the control stream during registration".to_string(),
                    ));
                }
            }
        }
    }

    /// Heartbeat on the control stream while data streams are served
    async fn run_session(&self, session: Session) -> SessionEnd {
        let Session {
            connection,
            mut control,
            ..
        } = session;

        let streams = serve_streams(connection.clone(), self.forwarder.clone());
        tokio::pin!(streams);

        let mut ping = tokio::time::interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;
        let mut waiting_for_pong = false;

        loop {
            tokio::select! {
                _ = self.shutdown_requested() => {
                    let _ = control
                        .send_message(&RelayMessage::Disconnect {
                            reason: "agent shutting down".to_string(),
                        })
                        .await;
                    let _ = control.finish().await;
                    let _ = timeout(DISCONNECT_GRACE, connection.closed()).await;
                    connection.close(0, "shutdown").await;
                    break SessionEnd::Shutdown;
                }

                _ = ping.tick() => {
                    if waiting_for_pong {
                        connection.close(2, "heartbeat timeout").await;
                        break SessionEnd::Lost("relay missed a heartbeat".to_string());
                    }
                    if let Err(e) = control.send_message(&RelayMessage::Ping { timestamp: now_millis() }).await {
                        break end_for_error(&connection, e).await;
                    }
                    waiting_for_pong = true;
                }

                result = control.recv_message() => match result {
                    Ok(Some(RelayMessage::Ping { timestamp })) => {
                        if let Err(e) = control.send_message(&RelayMessage::Pong { timestamp }).await {
                            break end_for_error(&connection, e).await;
                        }
                    }
                    Ok(Some(RelayMessage::Pong { timestamp })) => {
                        debug!(rtt_ms = now_millis().saturating_sub(timestamp), "Received pong");
                        waiting_for_pong = false;
                    }
                    Ok(Some(RelayMessage::Disconnect { reason })) => {
                        info!(reason = %reason, "Relay asked us to disconnect");
                        break SessionEnd::Lost(reason);
                    }
                    Ok(Some(RelayMessage::Error { code, message })) => {
                        warn!(code = %code, "Relay reported an error: {}", message);
                    }
                    Ok(Some(other)) => {
                        warn!(kind = other.kind(), "Unexpected message on control stream");
                    }
                    Ok(None) => {
                        break match timeout(Duration::from_millis(500), connection.closed()).await {
                            Ok(reason) => end_for_close_reason(reason),
                            Err(_) => SessionEnd::Lost("control stream closed".to_string()),
                        };
                    }
                    Err(e) => break end_for_error(&connection, e).await,
                },

                _ = &mut streams => break end_for_close_reason(connection.closed().await),
            }
        }
    }
}

async fn end_for_error(connection: &QuicConnection, error: TransportError) -> SessionEnd {
    if connection.is_closed() {
        end_for_close_reason(connection.closed().await)
    } else {
        SessionEnd::Lost(error.to_string())
    }
}

/// Hand every relay-opened stream to the forwarder on its own task
async fn serve_streams(connection: Arc<QuicConnection>, forwarder: Forwarder) {
    loop {
        match connection.accept_stream().await {
            Ok(Some(stream)) => {
                let forwarder = forwarder.clone();
                tokio::spawn(async move {
                    let stream_id = stream.stream_id();
                    if let Err(e) = forwarder.handle_stream(stream).await {
                        debug!(stream_id, error = %e, "Exchange ended with an error");
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped accepting streams");
                break;
            }
        }
    }
}
