//! WebSocket channels to the local service

use super::ForwardError;
use futures_util::{SinkExt, StreamExt};
use relay_proto::{is_hop_by_hop, sendable_close_code, RelayMessage};
use relay_transport::TransportStream;
use relay_transport_quic::QuicStream;
use std::borrow::Cow;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Time the second direction gets to wind down after the first one closed
const CLOSE_GRACE: Duration = Duration::from_secs(5);

fn local_url(local_address: &str, path: &str) -> String {
    let authority = local_address
        .strip_prefix("http://")
        .or_else(|| local_address.strip_prefix("https://"))
        .unwrap_or(local_address)
        .trim_end_matches('/');
    let scheme = if local_address.starts_with("https://") {
        "wss"
    } else {
        "ws"
    };
    format!("{}://{}{}", scheme, authority, path)
}

fn close_frame(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(sendable_close_code(code)),
        reason: reason.into(),
    }))
}

async fn refuse(mut stream: QuicStream, reason: String) -> Result<(), ForwardError> {
    stream
        .send_message(&RelayMessage::WsClose { code: 1011, reason })
        .await?;
    stream.finish().await?;
    Ok(())
}

/// Open the local socket, confirm with `WsOpened` and relay frames until
/// either side closes
pub async fn forward(
    local_address: &str,
    path: String,
    headers: Vec<(String, String)>,
    protocols: Vec<String>,
    mut stream: QuicStream,
) -> Result<(), ForwardError> {
    let url = local_url(local_address, &path);
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => return refuse(stream, format!("invalid local url {}: {}", url, e)).await,
    };

    for (name, value) in &headers {
        if is_hop_by_hop(name) || name.to_ascii_lowercase().starts_with("sec-websocket-") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            request.headers_mut().append(name, value);
        }
    }
    if !protocols.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&protocols.join(", ")) {
            request.headers_mut().insert("sec-websocket-protocol", value);
        }
    }

    let (socket, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(url = %url, error = %e, "Local WebSocket refused");
            return refuse(stream, format!("local websocket unavailable: {}", e)).await;
        }
    };

    let protocol = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    stream
        .send_message(&RelayMessage::WsOpened {
            protocol: protocol.clone(),
        })
        .await?;
    info!(path = %path, protocol = ?protocol, "Local WebSocket opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut send, mut recv) = stream.split();

    let local_to_relay = async {
        let mut frames = 0u64;
        loop {
            let forwarded = match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => RelayMessage::WsData {
                    data: text.into_bytes(),
                    is_binary: false,
                },
                Some(Ok(Message::Binary(data))) => RelayMessage::WsData {
                    data,
                    is_binary: true,
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
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
                            reason: "local service went away".to_string(),
                        })
                        .await;
                    break;
                }
            };
            if let Err(e) = send.send_message(&forwarded).await {
                debug!(error = %e, "Relay stream closed while forwarding");
                break;
            }
            frames += 1;
        }
        let _ = send.finish();
        frames
    };

    let relay_to_local = async {
        let mut frames = 0u64;
        loop {
            let outgoing = match recv.recv_message().await {
                Ok(Some(RelayMessage::WsData {
                    data,
                    is_binary: true,
                })) => Message::Binary(data),
                Ok(Some(RelayMessage::WsData {
                    data,
                    is_binary: false,
                })) => match String::from_utf8(data) {
                    Ok(text) => Message::Text(text),
                    Err(_) => {
                        let _ = ws_tx.send(close_frame(1007, "invalid utf-8 in text frame")).await;
                        break;
                    }
                },
                Ok(Some(RelayMessage::WsClose { code, reason })) => {
                    let _ = ws_tx.send(close_frame(code, reason)).await;
                    break;
                }
                Ok(Some(other)) => {
                    warn!(kind = other.kind(), "Unexpected message on websocket stream");
                    continue;
                }
                Ok(None) | Err(_) => {
                    let _ = ws_tx.send(close_frame(1001, "relay went away")).await;
                    break;
                }
            };
            if ws_tx.send(outgoing).await.is_err() {
                break;
            }
            frames += 1;
        }
        let _ = ws_tx.close().await;
        frames
    };

    tokio::pin!(local_to_relay, relay_to_local);
    let (outbound, inbound) = tokio::select! {
        outbound = &mut local_to_relay => {
            let inbound = tokio::time::timeout(CLOSE_GRACE, &mut relay_to_local).await.ok();
            (Some(outbound), inbound)
        }
        inbound = &mut relay_to_local => {
            let outbound = tokio::time::timeout(CLOSE_GRACE, &mut local_to_relay).await.ok();
            (outbound, Some(inbound))
        }
    };

    info!(
        path = %path,
        frames_out = ?outbound,
        frames_in = ?inbound,
        "Local WebSocket closed"
    );
    Ok(())
}
