//! Protocol message types

use serde::{Deserialize, Serialize};

/// Main relay protocol message enum
///
/// Control messages travel on stream 0, which the agent opens right after
/// connecting. Data messages are bound to the relay-opened stream carrying
/// them: one stream per proxied exchange, so they carry no exchange id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayMessage {
    // Control messages (Stream ID 0)
    Register {
        backend_id: String,
        token: String,
        protocol_version: u32,
    },
    Registered {
        backend_id: String,
        public_url: String,
        #[serde(with = "serde_bytes")]
        session_ticket: Vec<u8>,
        resumed: bool,
    },
    Reconnect {
        backend_id: String,
        token: String,
        #[serde(with = "serde_bytes")]
        session_ticket: Vec<u8>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Disconnect {
        reason: String,
    },

    // HTTP exchange
    HttpRequest {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        streaming: bool,
    },
    HttpResponse {
        status: u16,
        headers: Vec<(String, String)>,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        streaming: bool,
    },
    HttpChunk {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        is_final: bool,
    },

    // WebSocket channel
    WsOpen {
        path: String,
        headers: Vec<(String, String)>,
        protocols: Vec<String>,
    },
    WsOpened {
        protocol: Option<String>,
    },
    WsData {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        is_binary: bool,
    },
    WsClose {
        code: u16,
        reason: String,
    },
}

impl RelayMessage {
    /// Wire tag of the message, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Register { .. } => "register",
            RelayMessage::Registered { .. } => "registered",
            RelayMessage::Reconnect { .. } => "reconnect",
            RelayMessage::Ping { .. } => "ping",
            RelayMessage::Pong { .. } => "pong",
            RelayMessage::Error { .. } => "error",
            RelayMessage::Disconnect { .. } => "disconnect",
            RelayMessage::HttpRequest { .. } => "http_request",
            RelayMessage::HttpResponse { .. } => "http_response",
            RelayMessage::HttpChunk { .. } => "http_chunk",
            RelayMessage::WsOpen { .. } => "ws_open",
            RelayMessage::WsOpened { .. } => "ws_opened",
            RelayMessage::WsData { .. } => "ws_data",
            RelayMessage::WsClose { .. } => "ws_close",
        }
    }

    /// Whether this message belongs on the control stream
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            RelayMessage::Register { .. }
                | RelayMessage::Registered { .. }
                | RelayMessage::Reconnect { .. }
                | RelayMessage::Ping { .. }
                | RelayMessage::Pong { .. }
                | RelayMessage::Error { .. }
                | RelayMessage::Disconnect { .. }
        )
    }

    /// Build an `Error` control message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RelayMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Machine-readable reason carried by `RelayMessage::Error`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailed,
    DuplicateBackend,
    LimitReached,
    RegistrationFailed,
    ReconnectFailed,
    InvalidMessage,
    UnsupportedVersion,
}

impl ErrorCode {
    /// Errors after which retrying with the same credentials cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed | ErrorCode::DuplicateBackend | ErrorCode::UnsupportedVersion
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::DuplicateBackend => "DUPLICATE_BACKEND",
            ErrorCode::LimitReached => "LIMIT_REACHED",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::ReconnectFailed => "RECONNECT_FAILED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
        };
        f.write_str(s)
    }
}

// Raw byte blocks instead of a sequence of u8 elements
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
