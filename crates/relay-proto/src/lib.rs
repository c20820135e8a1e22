//! Relay Protocol Definitions
//!
//! This crate defines the messages exchanged between the public relay and a
//! private agent, the length-prefixed codec used to frame them on a stream,
//! and the output decoders the agent uses to cut streamed bodies at event
//! boundaries.

pub mod codec;
pub mod decoder;
pub mod messages;

pub use codec::{CodecError, RelayCodec};
pub use decoder::{DecodedEvent, DecoderKind, OutputDecoder};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u64 = 0;

/// Bodies larger than this are sent as `streaming` followed by `HttpChunk`s
pub const CHUNK_THRESHOLD: usize = 64 * 1024;

/// Maximum payload of a single `HttpChunk`
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Split a body into chunk-sized pieces, in order.
pub fn chunk_body(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    body.chunks(CHUNK_SIZE)
}

/// Whether a body of `len` bytes must be streamed rather than inlined.
pub fn needs_streaming(len: usize) -> bool {
    len > CHUNK_THRESHOLD
}

/// A WebSocket close code that may appear in a close frame.
///
/// Codes reserved for local signalling (1005, 1006, 1015) or outside the
/// registered ranges are replaced by 1000.
pub fn sendable_close_code(code: u16) -> u16 {
    match code {
        1000..=1003 | 1007..=1014 | 3000..=4999 => code,
        _ => 1000,
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "trailers",
    "host",
];

/// Headers that describe a single HTTP hop and are never carried across the relay
pub fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&name.as_str()) || name.starts_with("proxy-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_body_preserves_order() {
        let body: Vec<u8> = (0..(CHUNK_SIZE * 2 + 10)).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = chunk_body(&body).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 10);
        assert_eq!(chunks.concat(), body);
    }

    #[test]
    fn test_needs_streaming_threshold() {
        assert!(!needs_streaming(0));
        assert!(!needs_streaming(CHUNK_THRESHOLD));
        assert!(needs_streaming(CHUNK_THRESHOLD + 1));
    }

    #[test]
    fn test_sendable_close_code() {
        assert_eq!(sendable_close_code(1000), 1000);
        assert_eq!(sendable_close_code(1011), 1011);
        assert_eq!(sendable_close_code(4001), 4001);
        assert_eq!(sendable_close_code(1006), 1000);
        assert_eq!(sendable_close_code(1005), 1000);
        assert_eq!(sendable_close_code(42), 1000);
    }
}
