//! HTTP exchanges against the local service

use super::{ForwardError, CANCELLED};
use futures_util::StreamExt;
use relay_proto::{chunk_body, is_hop_by_hop, needs_streaming, DecoderKind, RelayMessage};
use relay_transport::TransportStream;
use relay_transport_quic::{QuicSendHalf, QuicStream};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::Method;
use tracing::{debug, warn};

/// An `HttpRequest` as received from the relay
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
}

fn request_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid request header"),
        }
    }
    map
}

fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn error_response(status: u16, message: String) -> RelayMessage {
    RelayMessage::HttpResponse {
        status,
        headers: vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body: message.into_bytes(),
        streaming: false,
    }
}

impl HttpForwarder {
    pub fn new(local_address: &str) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| ForwardError::Local(format!("failed to build HTTP client: {}", e)))?;

        let base_url = if local_address.starts_with("http://") || local_address.starts_with("https://") {
            local_address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", local_address)
        };

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(&self, request: LocalRequest) -> Result<reqwest::Request, ForwardError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("bad method '{}'", request.method)))?;
        if !request.path.starts_with('/') {
            return Err(ForwardError::InvalidRequest(format!(
                "path '{}' is not absolute",
                request.path
            )));
        }
        let url = format!("{}{}", self.base_url, request.path);

        self.client
            .request(method, url)
            .headers(request_headers(&request.headers))
            .body(request.body)
            .build()
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))
    }

    /// Run one exchange: call the local service and answer on `stream`
    pub async fn forward(
        &self,
        mut request: LocalRequest,
        mut stream: QuicStream,
    ) -> Result<(), ForwardError> {
        if request.streaming {
            loop {
                match stream.recv_message().await? {
                    Some(RelayMessage::HttpChunk { data, is_final }) => {
                        request.body.extend_from_slice(&data);
                        if is_final {
                            break;
                        }
                    }
                    Some(other) => {
                        stream.reset(CANCELLED);
                        return Err(ForwardError::InvalidRequest(format!(
                            "expected http_chunk, got {}",
                            other.kind()
                        )));
                    }
                    None => {
                        return Err(ForwardError::InvalidRequest(
                            "request body ended early".to_string(),
                        ))
                    }
                }
            }
        }

        let (mut send, _recv) = stream.split();

        let outgoing = match self.build(request) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                send.send_message(&error_response(400, e.to_string())).await?;
                send.finish()?;
                return Err(e);
            }
        };

        let result = tokio::select! {
            result = self.client.execute(outgoing) => result,
            Some(code) = send.stopped() => {
                debug!(code, "Relay abandoned the exchange");
                return Ok(());
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(local = %self.base_url, error = %e, "Local service unreachable");
                send.send_message(&error_response(
                    502,
                    format!("local service unavailable: {}", e),
                ))
                .await?;
                send.finish()?;
                return Ok(());
            }
        };

        relay_response(response, send).await
    }
}

async fn relay_response(
    response: reqwest::Response,
    mut send: QuicSendHalf,
) -> Result<(), ForwardError> {
    let status = response.status().as_u16();
    let headers = response_headers(response.headers());
    let kind = DecoderKind::for_content_type(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    let streaming = kind != DecoderKind::Raw
        || response
            .content_length()
            .map_or(true, |len| needs_streaming(len as usize));

    if !streaming {
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                send.send_message(&error_response(
                    502,
                    format!("failed to read local response: {}", e),
                ))
                .await?;
                send.finish()?;
                return Ok(());
            }
        };
        send.send_message(&RelayMessage::HttpResponse {
            status,
            headers,
            body: body.to_vec(),
            streaming: false,
        })
        .await?;
        send.finish()?;
        return Ok(());
    }

    send.send_message(&RelayMessage::HttpResponse {
        status,
        headers,
        body: Vec::new(),
        streaming: true,
    })
    .await?;

    let mut decoder = kind.decoder();
    let mut body = response.bytes_stream();
    let mut chunks = 0u64;
    loop {
        let next = tokio::select! {
            next = body.next() => next,
            Some(code) = send.stopped() => {
                debug!(code, chunks, "Relay stopped reading the response");
                return Ok(());
            }
        };

        match next {
            Some(Ok(bytes)) => {
                for event in decoder.push(&bytes) {
                    for piece in chunk_body(event.as_bytes()) {
                        send.send_message(&RelayMessage::HttpChunk {
                            data: piece.to_vec(),
                            is_final: false,
                        })
                        .await?;
                        chunks += 1;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, chunks, "Local response body failed");
                send.reset(CANCELLED);
                return Err(ForwardError::Local(e.to_string()));
            }
            None => break,
        }
    }

    let tail = decoder.finish().map(|e| e.into_bytes()).unwrap_or_default();
    send.send_message(&RelayMessage::HttpChunk {
        data: tail,
        is_final: true,
    })
    .await?;
    send.finish()?;
    debug!(chunks, "Streamed response complete");
    Ok(())
}
