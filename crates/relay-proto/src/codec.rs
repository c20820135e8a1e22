//! Codec for encoding/decoding relay messages

use crate::messages::RelayMessage;
use bincode::Options;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete message: {0} trailing bytes")]
    IncompleteMessage(usize),
}

/// Relay message codec
pub struct RelayCodec;

impl RelayCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    const HEADER_LEN: usize = 4;

    fn options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_limit(Self::MAX_MESSAGE_SIZE as u64)
            .reject_trailing_bytes()
    }

    /// Encode a relay message to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized message]
    pub fn encode(msg: &RelayMessage) -> Result<Bytes, CodecError> {
        let payload = Self::options().serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a relay message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error. A frame that fails to deserialize is consumed from the
    /// buffer so the caller can decide whether to keep reading.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RelayMessage>, CodecError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::HEADER_LEN + length {
            return Ok(None);
        }

        buf.advance(Self::HEADER_LEN);
        let msg_bytes = buf.split_to(length);

        let msg: RelayMessage = Self::options().deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<RelayMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }

    /// Called when the peer finished the stream: leftover bytes are a truncated frame
    pub fn check_eof(buf: &BytesMut) -> Result<(), CodecError> {
        if buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::IncompleteMessage(buf.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;
    use rand::{Rng, SeedableRng};

    fn sample_messages() -> Vec<RelayMessage> {
        vec![
            RelayMessage::Register {
                backend_id: "ws-1".to_string(),
                token: "header.claims.sig".to_string(),
                protocol_version: crate::PROTOCOL_VERSION,
            },
            RelayMessage::Registered {
                backend_id: "ws-1".to_string(),
                public_url: "http://localhost:8080/relay/ws-1".to_string(),
                session_ticket: vec![7; 32],
                resumed: false,
            },
            RelayMessage::Reconnect {
                backend_id: "ws-1".to_string(),
                token: "t".to_string(),
                session_ticket: vec![0, 255, 3],
            },
            RelayMessage::Ping { timestamp: 12345 },
            RelayMessage::Pong { timestamp: 67890 },
            RelayMessage::error(ErrorCode::LimitReached, "registry full"),
            RelayMessage::Disconnect {
                reason: "shutdown".to_string(),
            },
            RelayMessage::HttpRequest {
                method: "POST".to_string(),
                path: "/api/items?x=1".to_string(),
                headers: vec![
                    ("accept".to_string(), "a".to_string()),
                    ("accept".to_string(), "b".to_string()),
                ],
                body: b"{\"ok\":true}".to_vec(),
                streaming: false,
            },
            RelayMessage::HttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: Vec::new(),
                streaming: true,
            },
            RelayMessage::HttpChunk {
                data: vec![1, 2, 3],
                is_final: true,
            },
            RelayMessage::WsOpen {
                path: "/socket".to_string(),
                headers: vec![],
                protocols: vec!["chat".to_string()],
            },
            RelayMessage::WsOpened {
                protocol: Some("chat".to_string()),
            },
            RelayMessage::WsData {
                data: vec![0xde, 0xad, 0xbe, 0xef],
                is_binary: true,
            },
            RelayMessage::WsClose {
                code: 1000,
                reason: "normal".to_string(),
            },
        ]
    }

    #[test]
    fn test_encode_decode_every_variant() {
        for msg in sample_messages() {
            let encoded = RelayCodec::encode(&msg).unwrap();
            let mut buf = BytesMut::from(encoded.as_ref());

            let decoded = RelayCodec::decode(&mut buf).unwrap();
            assert_eq!(decoded, Some(msg));
            assert_eq!(buf.len(), 0);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = RelayMessage::Pong { timestamp: 67890 };
        let encoded = RelayCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(RelayCodec::decode(&mut buf).unwrap(), None);
        assert!(RelayCodec::check_eof(&buf).is_err());

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(RelayCodec::decode(&mut buf).unwrap(), Some(msg));
        assert!(RelayCodec::check_eof(&buf).is_ok());
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = RelayMessage::Ping { timestamp: 111 };
        let msg2 = RelayMessage::Pong { timestamp: 222 };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&RelayCodec::encode(&msg1).unwrap());
        buf.extend_from_slice(&RelayCodec::encode(&msg2).unwrap());

        let messages = RelayCodec::decode_all(&mut buf).unwrap();
        assert_eq!(messages, vec![msg1, msg2]);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_binary_payload_is_not_reencoded() {
        let data: Vec<u8> = (0..=255).collect();
        let msg = RelayMessage::WsData {
            data: data.clone(),
            is_binary: true,
        };

        let encoded = RelayCodec::encode(&msg).unwrap();
        // Raw block: the payload appears verbatim in the frame
        assert!(encoded.windows(data.len()).any(|w| w == data.as_slice()));
        assert!(encoded.len() < data.len() + 16);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(RelayCodec::MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            RelayCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_variant_is_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[200u8]);

        assert!(matches!(
            RelayCodec::decode(&mut buf),
            Err(CodecError::Serialization(_))
        ));
        // The bad frame is consumed
        assert!(buf.is_empty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = RelayCodec::encode(&RelayMessage::Ping { timestamp: 1 }).unwrap();
        let inner = &payload[4..];

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((inner.len() + 2) as u32).to_be_bytes());
        buf.extend_from_slice(inner);
        buf.extend_from_slice(&[0, 0]);

        assert!(RelayCodec::decode(&mut buf).is_err());
    }

    #[test]
    fn test_random_garbage_never_panics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for _ in 0..2000 {
            let len = rng.gen_range(0..256);
            let body: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let mut buf = BytesMut::new();
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(&body);

            // Ok or Err are both fine; only a panic would fail the test
            let _ = RelayCodec::decode(&mut buf);
        }
    }

    #[test]
    fn test_truncated_frames_never_panic() {
        for msg in sample_messages() {
            let encoded = RelayCodec::encode(&msg).unwrap();
            for cut in 0..encoded.len() {
                let mut buf = BytesMut::from(&encoded[..cut]);
                assert_eq!(RelayCodec::decode(&mut buf).unwrap(), None);
            }
        }
    }

    #[test]
    fn test_corrupted_payload_never_panics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for msg in sample_messages() {
            let encoded = RelayCodec::encode(&msg).unwrap();
            for _ in 0..50 {
                let mut bytes = encoded.to_vec();
                let idx = rng.gen_range(4..bytes.len());
                bytes[idx] = rng.gen();

                let mut buf = BytesMut::from(bytes.as_slice());
                let _ = RelayCodec::decode(&mut buf);
            }
        }
    }
}
