//! QUIC stream implementation

use async_trait::async_trait;
use bytes::BytesMut;
use quinn::{Dir, RecvStream, SendStream, Side, StreamId, VarInt};
use relay_proto::{RelayCodec, RelayMessage};
use relay_transport::{TransportError, TransportResult, TransportStream};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Full QUIC stream id: `index << 2 | dir << 1 | initiator`.
///
/// The agent's control stream is therefore always id 0, and relay-opened
/// exchange streams never collide with agent-opened ones.
pub fn wire_stream_id(id: StreamId) -> u64 {
    let initiator = match id.initiator() {
        Side::Client => 0,
        Side::Server => 1,
    };
    let dir = match id.dir() {
        Dir::Bi => 0,
        Dir::Uni => 2,
    };
    (id.index() << 2) | dir | initiator
}

fn write_error(e: quinn::WriteError) -> TransportError {
    match e {
        quinn::WriteError::Stopped(code) => TransportError::StreamReset(code.into_inner()),
        quinn::WriteError::ConnectionLost(e) => TransportError::ConnectionLost(e.to_string()),
        quinn::WriteError::ClosedStream => TransportError::StreamClosed,
        other => TransportError::ConnectionError(other.to_string()),
    }
}

fn read_error(e: quinn::ReadError) -> TransportError {
    match e {
        quinn::ReadError::Reset(code) => TransportError::StreamReset(code.into_inner()),
        quinn::ReadError::ConnectionLost(e) => TransportError::ConnectionLost(e.to_string()),
        quinn::ReadError::ClosedStream => TransportError::StreamClosed,
        other => TransportError::ConnectionError(other.to_string()),
    }
}

async fn write_message(
    send: &mut SendStream,
    stream_id: u64,
    message: &RelayMessage,
) -> TransportResult<()> {
    let encoded =
        RelayCodec::encode(message).map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    send.write_all(&encoded).await.map_err(write_error)?;

    trace!(stream_id, kind = message.kind(), "Sent message");
    Ok(())
}

async fn read_message(
    recv: &mut RecvStream,
    buffer: &mut BytesMut,
    stream_id: u64,
    closed: &mut bool,
) -> TransportResult<Option<RelayMessage>> {
    if *closed {
        return Ok(None);
    }

    loop {
        match RelayCodec::decode(buffer).map_err(|e| TransportError::ProtocolError(e.to_string()))? {
            Some(message) => {
                trace!(stream_id, kind = message.kind(), "Received message");
                return Ok(Some(message));
            }
            None => match recv.read_chunk(READ_CHUNK, true).await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk.bytes),
                Ok(None) => {
                    *closed = true;
                    RelayCodec::check_eof(buffer)
                        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
                    return Ok(None);
                }
                Err(e) => {
                    *closed = true;
                    return Err(read_error(e));
                }
            },
        }
    }
}

/// QUIC stream wrapper
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    send_closed: bool,
    recv_closed: bool,
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = wire_stream_id(send.id());
        Self {
            send,
            recv,
            stream_id,
            send_closed: false,
            recv_closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Split the stream into separate send and receive halves
    /// so both directions can be driven concurrently without a lock.
    pub fn split(self) -> (QuicSendHalf, QuicRecvHalf) {
        let send_half = QuicSendHalf {
            send: self.send,
            stream_id: self.stream_id,
            closed: self.send_closed,
        };
        let recv_half = QuicRecvHalf {
            recv: self.recv,
            stream_id: self.stream_id,
            closed: self.recv_closed,
            recv_buffer: self.recv_buffer,
        };
        (send_half, recv_half)
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn send_message(&mut self, message: &RelayMessage) -> TransportResult<()> {
        if self.send_closed {
            return Err(TransportError::StreamClosed);
        }
        write_message(&mut self.send, self.stream_id, message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>> {
        read_message(
            &mut self.recv,
            &mut self.recv_buffer,
            self.stream_id,
            &mut self.recv_closed,
        )
        .await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.send_closed {
            return Ok(());
        }
        self.send_closed = true;
        self.send
            .finish()
            .map_err(|_| TransportError::StreamClosed)?;
        Ok(())
    }

    fn reset(&mut self, code: u32) {
        let code = VarInt::from_u32(code);
        let _ = self.send.reset(code);
        let _ = self.recv.stop(code);
        self.send_closed = true;
        self.recv_closed = true;
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.send_closed && self.recv_closed
    }
}

/// Send half of a split QUIC stream
#[derive(Debug)]
pub struct QuicSendHalf {
    send: SendStream,
    stream_id: u64,
    closed: bool,
}

impl QuicSendHalf {
    pub async fn send_message(&mut self, message: &RelayMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }
        write_message(&mut self.send, self.stream_id, message).await
    }

    pub fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send
            .finish()
            .map_err(|_| TransportError::StreamClosed)
    }

    pub fn reset(&mut self, code: u32) {
        let _ = self.send.reset(VarInt::from_u32(code));
        self.closed = true;
    }

    /// Resolves with the peer's code once it stops reading
    ///
    /// Resolves to `None` when the stream instead completes normally.
    pub async fn stopped(&mut self) -> Option<u32> {
        match self.send.stopped().await {
            Ok(Some(code)) => u32::try_from(code.into_inner()).ok(),
            Ok(None) | Err(_) => None,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// Receive half of a split QUIC stream
#[derive(Debug)]
pub struct QuicRecvHalf {
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    recv_buffer: BytesMut,
}

impl QuicRecvHalf {
    pub async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>> {
        read_message(
            &mut self.recv,
            &mut self.recv_buffer,
            self.stream_id,
            &mut self.closed,
        )
        .await
    }

    /// Tell the peer we will not read any more
    pub fn stop(&mut self, code: u32) {
        let _ = self.recv.stop(VarInt::from_u32(code));
        self.closed = true;
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}
