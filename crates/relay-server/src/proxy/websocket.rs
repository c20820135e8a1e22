//! WebSocket bridging over a backend stream
//!
//! The public upgrade is only completed after the backend confirms its own
//! local socket with `WsOpened`; from then on each direction is a plain
//! ordered frame relay.

use super::{forwardable_headers, ProxyError};
use crate::proxy::http::wait_for_backend;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use relay_proto::{sendable_close_code, RelayMessage};
use relay_transport::{TransportConnection, TransportError, TransportStream};
use relay_transport_quic::QuicStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time the second direction gets to wind down after the first one closed
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

const CANCELLED: u32 = 1;

/// Handshake headers that belong to the public hop
const WS_HANDSHAKE_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "sec-websocket-accept",
];

fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn open_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    forwardable_headers(headers)
        .into_iter()
        .filter(|(name, _)| !WS_HANDSHAKE_HEADERS.contains(&name.as_str()))
        .collect()
}

pub async fn proxy_websocket(
    state: Arc<AppState>,
    backend_id: String,
    path: String,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ProxyError> {
    if !state.registry.contains(&backend_id) {
        return Err(ProxyError::BackendUnavailable(backend_id));
    }

    let deadline = Instant::now() + state.config.request_timeout();
    let open = RelayMessage::WsOpen {
        path: path.clone(),
        headers: open_headers(&headers),
        protocols: requested_protocols(&headers),
    };

    let mut dead_connection = None;
    let mut stream = loop {
        let active = wait_for_backend(&state, &backend_id, dead_connection, deadline).await?;
        let opened = async {
            let mut stream = active.handle.open_stream().await?;
            stream.send_message(&open).await?;
            Ok::<_, TransportError>(stream)
        };
        match tokio::time::timeout_at(deadline, opened).await {
            Err(_) => return Err(ProxyError::Timeout(backend_id.clone())),
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) if e.is_connection_loss() || active.handle.is_closed() => {
                debug!(
                    backend_id = %backend_id,
                    connection_id = active.connection_id,
                    "Connection lost before the WebSocket opened, waiting for resume"
                );
                dead_connection = Some(active.connection_id);
            }
            Ok(Err(e)) => return Err(ProxyError::Backend(e.to_string())),
        }
    };

    let open_timeout = state.config.ws_open_timeout();
    let protocol = match tokio::time::timeout(open_timeout, stream.recv_message()).await {
        Ok(Ok(Some(RelayMessage::WsOpened { protocol }))) => protocol,
        Ok(Ok(Some(RelayMessage::WsClose { code, reason }))) => {
            return Err(ProxyError::WebSocketRefused(format!("{} {}", code, reason)));
        }
        Ok(Ok(Some(other))) => {
            stream.reset(CANCELLED);
            return Err(ProxyError::Backend(format!(
                "expected ws_opened, got {}",
                other.kind()
            )));
        }
        Ok(Ok(None)) => {
            return Err(ProxyError::WebSocketRefused(
                "backend closed the stream".to_string(),
            ))
        }
        Ok(Err(e)) => return Err(ProxyError::WebSocketRefused(e.to_string())),
        Err(_) => {
            stream.reset(CANCELLED);
            return Err(ProxyError::WebSocketRefused(format!(
                "no confirmation within {}s",
                open_timeout.as_secs()
            )));
        }
    };

    info!(backend_id = %backend_id, path = %path, protocol = ?protocol, "WebSocket opened");

    let upgrade = match protocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };
    Ok(upgrade.on_upgrade(move |socket| bridge(socket, stream, backend_id)))
}

/// Relay frames both ways until one side closes, then give the other side
/// `CLOSE_GRACE` to finish
async fn bridge(socket: WebSocket, stream: QuicStream, backend_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut send, mut recv) = stream.split();

    let public_to_backend = async {
        let mut frames = 0u64;
        loop {
            let forwarded = match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => RelayMessage::WsData {
                    data: text.as_str().as_bytes().to_vec(),
                    is_binary: false,
                },
                Some(Ok(Message::Binary(data))) => RelayMessage::WsData {
                    data: data.to_vec(),
                    is_binary: true,
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.as_str().to_string()))
                        .unwrap_or((1000, String::new()));
                    let _ = send
                        .send_message(&RelayMessage::WsClose { code, reason })
                        .await;
                    break;
                }
                Some(Err(_)) | None => {
                    let _ = send
                        .send_message(&RelayMessage::WsClose {
                            code: 1001,
                            reason: "client went away".to_string(),
                        })
                        .await;
                    break;
                }
            };
            if let Err(e) = send.send_message(&forwarded).await {
                debug!(error = %e, "Backend stream closed while forwarding");
                break;
            }
            frames += 1;
        }
        let _ = send.finish();
        frames
    };

    let backend_to_public = async {
        let mut frames = 0u64;
        loop {
            let outgoing = match recv.recv_message().await {
                Ok(Some(RelayMessage::WsData {
                    data,
                    is_binary: true,
                })) => Message::Binary(data.into()),
                Ok(Some(RelayMessage::WsData {
                    data,
                    is_binary: false,
                })) => match String::from_utf8(data) {
                    Ok(text) => Message::Text(text.into()),
                    Err(_) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: 1007,
                                reason: "invalid utf-8 in text frame".into(),
                            })))
                            .await;
                        break;
                    }
                },
                Ok(Some(RelayMessage::WsClose { code, reason })) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: sendable_close_code(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                Ok(Some(other)) => {
                    warn!(kind = other.kind(), "Unexpected message on websocket stream");
                    continue;
                }
                Ok(None) | Err(_) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1011,
                            reason: "backend went away".into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_tx.send(outgoing).await.is_err() {
                break;
            }
            frames += 1;
        }
        frames
    };

    tokio::pin!(public_to_backend, backend_to_public);
    let (inbound, outbound) = tokio::select! {
        inbound = &mut public_to_backend => {
            let outbound = tokio::time::timeout(CLOSE_GRACE, &mut backend_to_public).await.ok();
            (Some(inbound), outbound)
        }
        outbound = &mut backend_to_public => {
            let inbound = tokio::time::timeout(CLOSE_GRACE, &mut public_to_backend).await.ok();
            (inbound, Some(outbound))
        }
    };

    info!(
        backend_id = %backend_id,
        frames_in = ?inbound,
        frames_out = ?outbound,
        "WebSocket closed"
    );
}
