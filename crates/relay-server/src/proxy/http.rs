//! HTTP exchange over a backend stream

use super::{forwardable_headers, header_map, ProxyError};
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use relay_control::{ActiveBackend, CorrelationId, PendingError, PendingRequests, RegistryError};
use relay_proto::{chunk_body, needs_streaming, RelayMessage};
use relay_transport::{TransportConnection, TransportError, TransportResult, TransportStream};
use relay_transport_quic::{QuicConnection, QuicRecvHalf, QuicSendHalf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Stream reset/stop code when the public caller went away
const CANCELLED: u32 = 1;

/// Chunks buffered between the backend stream and a streaming public body
const STREAM_BUFFER: usize = 16;

/// Response head plus body as received from the backend
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Full(Vec<u8>),
    Streaming(mpsc::Receiver<Result<Bytes, std::io::Error>>),
}

impl ProxiedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = match self.body {
            ResponseBody::Full(bytes) => Body::from(bytes),
            ResponseBody::Streaming(rx) => Body::from_stream(futures_util::stream::unfold(
                rx,
                |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
            )),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = header_map(&self.headers);
        response
    }
}

enum DispatchError {
    /// The control connection died before a response arrived
    ConnectionLost,
    Failed(ProxyError),
}

pub(crate) fn registry_error(e: RegistryError) -> ProxyError {
    match e {
        RegistryError::Timeout(id) => ProxyError::Timeout(id),
        RegistryError::Unavailable(id) | RegistryError::NotFound(id) => {
            ProxyError::BackendUnavailable(id)
        }
        other => ProxyError::Backend(other.to_string()),
    }
}

/// Cancels the pending entry and the backend exchange unless disarmed
struct ExchangeGuard {
    pending: PendingRequests<ProxiedResponse>,
    id: CorrelationId,
    send: Option<QuicSendHalf>,
    cancel: Option<oneshot::Sender<()>>,
}

impl ExchangeGuard {
    fn disarm(mut self) {
        // Dropping the sender without a value tells the reader nothing was cancelled
        self.cancel.take();
        self.send.take();
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            self.pending.cancel(&self.id);
            if let Some(send) = self.send.as_mut() {
                send.reset(CANCELLED);
            }
            let _ = cancel.send(());
        }
    }
}

pub async fn proxy_http(
    state: Arc<AppState>,
    backend_id: String,
    path: String,
    request: Request,
) -> Result<Response, ProxyError> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::debug_span!("proxy_http", backend_id = %backend_id, %request_id);
    proxy_http_inner(state, backend_id, path, request)
        .instrument(span)
        .await
}

async fn proxy_http_inner(
    state: Arc<AppState>,
    backend_id: String,
    path: String,
    request: Request,
) -> Result<Response, ProxyError> {
    let deadline = Instant::now() + state.config.request_timeout();

    // Unknown ids fail fast, with no waiting
    if !state.registry.contains(&backend_id) {
        debug!("No backend registered");
        return Err(ProxyError::BackendUnavailable(backend_id));
    }

    let limits = state.limits_for(&backend_id);
    let (parts, body) = request.into_parts();

    let declared_len = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > limits.max_bytes) {
        return Err(ProxyError::PayloadTooLarge(limits.max_bytes));
    }
    let body = axum::body::to_bytes(body, limits.max_bytes)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("failed to read request body: {}", e)))?;

    let _request_permit = tokio::time::timeout_at(deadline, limits.requests.clone().acquire_owned())
        .await
        .map_err(|_| ProxyError::Timeout(backend_id.clone()))?
        .map_err(|_| ProxyError::BackendUnavailable(backend_id.clone()))?;

    let _byte_permit = if body.is_empty() {
        None
    } else {
        let permits =
            u32::try_from(body.len()).map_err(|_| ProxyError::PayloadTooLarge(limits.max_bytes))?;
        let permit = tokio::time::timeout_at(
            deadline,
            limits.bytes.clone().acquire_many_owned(permits),
        )
        .await
        .map_err(|_| ProxyError::Timeout(backend_id.clone()))?
        .map_err(|_| ProxyError::BackendUnavailable(backend_id.clone()))?;
        Some(permit)
    };

    let streaming = needs_streaming(body.len());
    let message = RelayMessage::HttpRequest {
        method: parts.method.to_string(),
        path,
        headers: forwardable_headers(&parts.headers),
        body: if streaming { Vec::new() } else { body.to_vec() },
        streaming,
    };

    let mut lost_connection = None;
    loop {
        let active = wait_for_backend(&state, &backend_id, lost_connection, deadline).await?;
        match dispatch_once(&state, &backend_id, &active, &message, &body, deadline).await {
            Ok(response) => return Ok(response),
            Err(DispatchError::ConnectionLost) => {
                info!(
                    connection_id = active.connection_id,
                    "Control connection lost mid-request, waiting for backend"
                );
                lost_connection = Some(active.connection_id);
            }
            Err(DispatchError::Failed(e)) => return Err(e),
        }
    }
}

/// Wait for a live connection, skipping one already known to be dead
pub(crate) async fn wait_for_backend(
    state: &AppState,
    backend_id: &str,
    dead_connection: Option<u64>,
    deadline: Instant,
) -> Result<ActiveBackend<Arc<QuicConnection>>, ProxyError> {
    loop {
        let active = state
            .registry
            .wait_active(backend_id, deadline)
            .await
            .map_err(registry_error)?;

        let stale = active.handle.is_closed() || dead_connection == Some(active.connection_id);
        if !stale {
            return Ok(active);
        }
        // The control handler has not noticed the loss yet
        if Instant::now() >= deadline {
            return Err(ProxyError::Timeout(backend_id.to_string()));
        }
        let retry_at = (Instant::now() + Duration::from_millis(25)).min(deadline);
        tokio::time::sleep_until(retry_at).await;
    }
}

fn classify(e: TransportError, connection: &QuicConnection) -> DispatchError {
    if e.is_connection_loss() || connection.is_closed() {
        DispatchError::ConnectionLost
    } else {
        DispatchError::Failed(ProxyError::Backend(e.to_string()))
    }
}

async fn dispatch_once(
    state: &AppState,
    backend_id: &str,
    active: &ActiveBackend<Arc<QuicConnection>>,
    message: &RelayMessage,
    body: &Bytes,
    deadline: Instant,
) -> Result<Response, DispatchError> {
    let connection = &active.handle;

    let stream = tokio::time::timeout_at(deadline, connection.open_stream())
        .await
        .map_err(|_| DispatchError::Failed(ProxyError::Timeout(backend_id.to_string())))?
        .map_err(|e| classify(e, connection))?;

    let id = CorrelationId::new(active.connection_id, stream.stream_id());
    let (mut send, recv) = stream.split();

    let rx = state
        .pending
        .register_until(id, backend_id, Instant::now(), deadline)
        .map_err(|e| DispatchError::Failed(ProxyError::Backend(e.to_string())))?;
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut guard = ExchangeGuard {
        pending: state.pending.clone(),
        id,
        send: None,
        cancel: Some(cancel_tx),
    };

    tokio::spawn(
        read_response(state.pending.clone(), id, recv, cancel_rx).in_current_span(),
    );

    if let Err(e) = send_request(&mut send, message, body).await {
        return Err(classify(e, connection));
    }
    let _ = send.finish();
    guard.send = Some(send);
    debug!(stream_id = id.stream_id, "Request dispatched");

    match state.pending.wait(id, rx, deadline).await {
        Ok(response) => {
            guard.disarm();
            Ok(response.into_response())
        }
        Err(PendingError::Timeout) => {
            warn!(stream_id = id.stream_id, "Request timed out");
            Err(DispatchError::Failed(ProxyError::Timeout(
                backend_id.to_string(),
            )))
        }
        Err(PendingError::ConnectionLost) => Err(DispatchError::ConnectionLost),
        Err(PendingError::BackendGone(id)) => {
            Err(DispatchError::Failed(ProxyError::BackendUnavailable(id)))
        }
        Err(e) => Err(DispatchError::Failed(ProxyError::Backend(e.to_string()))),
    }
}

async fn send_request(
    send: &mut QuicSendHalf,
    message: &RelayMessage,
    body: &Bytes,
) -> TransportResult<()> {
    send.send_message(message).await?;

    if let RelayMessage::HttpRequest {
        streaming: true, ..
    } = message
    {
        let mut chunks = chunk_body(body).peekable();
        while let Some(chunk) = chunks.next() {
            send.send_message(&RelayMessage::HttpChunk {
                data: chunk.to_vec(),
                is_final: chunks.peek().is_none(),
            })
            .await?;
        }
    }
    Ok(())
}

/// Per-stream reader: resolves the pending entry, then pumps streamed chunks
async fn read_response(
    pending: PendingRequests<ProxiedResponse>,
    id: CorrelationId,
    mut recv: QuicRecvHalf,
    mut cancel: oneshot::Receiver<()>,
) {
    let first = tokio::select! {
        message = recv.recv_message() => message,
        Ok(()) = &mut cancel => {
            recv.stop(CANCELLED);
            return;
        }
    };

    match first {
        Ok(Some(RelayMessage::HttpResponse {
            status,
            headers,
            body,
            streaming: false,
        })) => {
            pending.respond(
                &id,
                ProxiedResponse {
                    status,
                    headers,
                    body: ResponseBody::Full(body),
                },
            );
        }
        Ok(Some(RelayMessage::HttpResponse {
            status,
            headers,
            body,
            streaming: true,
        })) => {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            if !body.is_empty() {
                let _ = tx.try_send(Ok(Bytes::from(body)));
            }
            let delivered = pending.respond(
                &id,
                ProxiedResponse {
                    status,
                    headers,
                    body: ResponseBody::Streaming(rx),
                },
            );
            if !delivered {
                recv.stop(CANCELLED);
                return;
            }
            pump_chunks(id, recv, tx).await;
        }
        Ok(Some(other)) => {
            warn!(correlation_id = %id, kind = other.kind(), "Expected http_response");
            pending.fail(&id, PendingError::NoResponse);
        }
        Ok(None) => {
            pending.fail(&id, PendingError::NoResponse);
        }
        Err(e) if e.is_connection_loss() => {
            pending.fail(&id, PendingError::ConnectionLost);
        }
        Err(e) => {
            debug!(correlation_id = %id, error = %e, "Stream failed before response");
            pending.fail(&id, PendingError::NoResponse);
        }
    }
}

async fn pump_chunks(
    id: CorrelationId,
    mut recv: QuicRecvHalf,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    loop {
        let message = tokio::select! {
            message = recv.recv_message() => message,
            _ = tx.closed() => {
                debug!(correlation_id = %id, "Public caller dropped streaming response");
                recv.stop(CANCELLED);
                return;
            }
        };

        match message {
            Ok(Some(RelayMessage::HttpChunk { data, is_final })) => {
                if !data.is_empty() && tx.send(Ok(Bytes::from(data))).await.is_err() {
                    recv.stop(CANCELLED);
                    return;
                }
                if is_final {
                    return;
                }
            }
            Ok(Some(other)) => {
                warn!(correlation_id = %id, kind = other.kind(), "Expected http_chunk");
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unexpected message in response stream",
                    )))
                    .await;
                return;
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_response_conversion() {
        let response = ProxiedResponse {
            status: 201,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("connection".into(), "close".into()),
            ],
            body: ResponseBody::Full(b"{\"ok\":true}".to_vec()),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert!(!response.headers().contains_key("connection"));
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_streaming_response_conversion() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"data: a\n\n"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"data: b\n\n"))).await.unwrap();
        drop(tx);

        let response = ProxiedResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
            body: ResponseBody::Streaming(rx),
        }
        .into_response();

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: a\n\ndata: b\n\n");
    }

    #[test]
    fn test_invalid_status_maps_to_bad_gateway() {
        let response = ProxiedResponse {
            status: 1000,
            headers: vec![],
            body: ResponseBody::Full(Vec::new()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_registry_error_mapping() {
        assert!(matches!(
            registry_error(RegistryError::Timeout("a".into())),
            ProxyError::Timeout(_)
        ));
        assert!(matches!(
            registry_error(RegistryError::Unavailable("a".into())),
            ProxyError::BackendUnavailable(_)
        ));
    }
}
