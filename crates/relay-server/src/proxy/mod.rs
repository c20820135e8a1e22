//! Public proxy surface: `/relay/{backend_id}/{*path}`

pub mod http;
pub mod websocket;

use crate::state::AppState;
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
pub use relay_proto::is_hop_by_hop;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend {0} is unavailable")]
    BackendUnavailable(String),

    #[error("timed out waiting for backend {0}")]
    Timeout(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("websocket refused by backend: {0}")]
    WebSocketRefused(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
            ProxyError::WebSocketRefused(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), format!("{}\n", self)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if matches!(self, ProxyError::Unauthorized(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// Flatten a header map into the wire representation, dropping hop-by-hop headers
pub fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
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

/// Rebuild a header map from the wire representation
pub fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid response header"),
        }
    }
    map
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Entry point for every `/relay/...` request
pub async fn relay_handler(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let Some(backend_id) = params.get("backend_id").cloned() else {
        return ProxyError::BadRequest("missing backend id".to_string()).into_response();
    };
    let mut path = format!("/{}", params.get("path").map(String::as_str).unwrap_or(""));
    if let Some(query) = request.uri().query() {
        path.push('?');
        path.push_str(query);
    }

    if is_websocket_upgrade(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => websocket::proxy_websocket(state, backend_id, path, parts.headers, upgrade)
                .await
                .unwrap_or_else(IntoResponse::into_response),
            Err(rejection) => rejection.into_response(),
        };
    }

    http::proxy_http(state, backend_id, path, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Bearer-token gate in front of the proxy routes
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(validator) = state.public_auth.as_ref() else {
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        None => ProxyError::Unauthorized("missing bearer token".to_string()).into_response(),
        Some(token) => match validator.validate(token) {
            Ok(_) => next.run(request).await,
            Err(e) => {
                warn!(error = %e, "Rejected public request");
                ProxyError::Unauthorized(e.to_string()).into_response()
            }
        },
    }
}
