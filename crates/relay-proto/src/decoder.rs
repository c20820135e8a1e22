//! Output decoders for streamed bodies
//!
//! A streamed local response arrives as arbitrary byte buffers. Before the
//! agent forwards it as `HttpChunk`s, it runs the bytes through an
//! [`OutputDecoder`] picked by content type, so each chunk carries whole
//! events (one SSE event, one line) instead of an arbitrary slice.
//!
//! Decoders only pick where chunks are cut. Every input byte comes out
//! exactly once, in order, and a buffer that grows past [`CHUNK_SIZE`]
//! without a delimiter is flushed as raw bytes.

use crate::CHUNK_SIZE;
use bytes::{Buf, BytesMut};

/// Which decoder to use for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    /// Pass bytes through as they arrive
    Raw,
    /// Newline-delimited output (NDJSON, logs)
    Lines,
    /// `text/event-stream`
    ServerSentEvents,
}

impl DecoderKind {
    /// Pick a decoder from a `Content-Type` header value
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        let Some(ct) = content_type else {
            return DecoderKind::Raw;
        };
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "text/event-stream" => DecoderKind::ServerSentEvents,
            "application/x-ndjson" | "application/jsonl" | "application/jsonlines" => {
                DecoderKind::Lines
            }
            _ => DecoderKind::Raw,
        }
    }

    pub fn decoder(self) -> OutputDecoder {
        match self {
            DecoderKind::Raw => OutputDecoder::Raw,
            DecoderKind::Lines => OutputDecoder::Lines(LineDecoder::default()),
            DecoderKind::ServerSentEvents => OutputDecoder::Sse(SseDecoder::default()),
        }
    }
}

/// A typed event produced by a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Opaque bytes, forwarded as-is
    Raw(Vec<u8>),
    /// One complete line, including its terminator
    Line(Vec<u8>),
    /// One complete server-sent event
    Sse(SseEvent),
}

impl DecodedEvent {
    /// The wire bytes of the event, exactly as received
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DecodedEvent::Raw(b) | DecodedEvent::Line(b) => b,
            DecodedEvent::Sse(e) => &e.raw,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            DecodedEvent::Raw(b) | DecodedEvent::Line(b) => b,
            DecodedEvent::Sse(e) => e.raw,
        }
    }
}

/// A parsed server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
    /// Original bytes including the blank-line terminator
    pub raw: Vec<u8>,
}

/// Turns raw bytes into a sequence of typed events
#[derive(Debug)]
pub enum OutputDecoder {
    Raw,
    Lines(LineDecoder),
    Sse(SseDecoder),
}

impl OutputDecoder {
    pub fn kind(&self) -> DecoderKind {
        match self {
            OutputDecoder::Raw => DecoderKind::Raw,
            OutputDecoder::Lines(_) => DecoderKind::Lines,
            OutputDecoder::Sse(_) => DecoderKind::ServerSentEvents,
        }
    }

    /// Feed bytes, returning every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        match self {
            OutputDecoder::Raw if bytes.is_empty() => Vec::new(),
            OutputDecoder::Raw => vec![DecodedEvent::Raw(bytes.to_vec())],
            OutputDecoder::Lines(d) => d.push(bytes),
            OutputDecoder::Sse(d) => d.push(bytes),
        }
    }

    /// End of input: flush whatever is buffered as a final event
    pub fn finish(&mut self) -> Option<DecodedEvent> {
        match self {
            OutputDecoder::Raw => None,
            OutputDecoder::Lines(d) => d.finish(),
            OutputDecoder::Sse(d) => d.finish(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            events.push(DecodedEvent::Line(line.to_vec()));
        }
        events.extend(flush_oversized(&mut self.buf));
        events
    }

    fn finish(&mut self) -> Option<DecodedEvent> {
        if self.buf.is_empty() {
            return None;
        }
        Some(DecodedEvent::Line(self.buf.split().to_vec()))
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = find_event_end(&self.buf) {
            let raw = self.buf.split_to(end);
            events.push(parse_event(raw.to_vec()));
        }
        events.extend(flush_oversized(&mut self.buf));
        events
    }

    fn finish(&mut self) -> Option<DecodedEvent> {
        if self.buf.is_empty() {
            return None;
        }
        Some(parse_event(self.buf.split().to_vec()))
    }
}

/// Hand back an undelimited buffer once it outgrows one chunk
fn flush_oversized(buf: &mut BytesMut) -> Option<DecodedEvent> {
    (buf.len() >= CHUNK_SIZE).then(|| DecodedEvent::Raw(buf.split().to_vec()))
}

/// Offset just past the blank line that terminates the first event, if any.
/// Accepts `\n\n`, `\r\n\r\n` and mixed terminators.
fn find_event_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut line_start = 0;
    while i < buf.len() {
        let eol_len = match buf[i] {
            b'\n' => 1,
            b'\r' if buf.get(i + 1) == Some(&b'\n') => 2,
            b'\r' if i + 1 < buf.len() => 1,
            // lone trailing \r: wait for more input
            b'\r' => return None,
            _ => {
                i += 1;
                continue;
            }
        };
        if i == line_start {
            return Some(i + eol_len);
        }
        i += eol_len;
        line_start = i;
    }
    None
}

fn parse_event(raw: Vec<u8>) -> DecodedEvent {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<String> = Vec::new();
    let mut has_field = false;

    let text = String::from_utf8_lossy(&raw);
    for line in text.split(['\n', '\r']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "retry" => event.retry = value.parse().ok(),
            _ => continue,
        }
        has_field = true;
    }

    // Stray blank lines carry no event but still belong to the body
    if !has_field && raw.iter().all(|b| b.is_ascii_whitespace()) {
        return DecodedEvent::Raw(raw);
    }

    event.data = data_lines.join("\n");
    event.raw = raw;
    DecodedEvent::Sse(event)
}

/// Drain helper used by tests and callers that only need bytes
pub fn drain_bytes(decoder: &mut OutputDecoder, mut input: impl Buf) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while input.has_remaining() {
        let chunk = input.chunk().to_vec();
        input.advance(chunk.len());
        out.extend(decoder.push(&chunk).into_iter().map(DecodedEvent::into_bytes));
    }
    out.extend(decoder.finish().map(DecodedEvent::into_bytes));
    out
}
