//! Server-Sent Events codec
//!
//! A stream is framed into chunks terminated by blank lines. The
//! decoder is incremental so it can be fed straight from an upstream
//! byte stream: network reads rarely align with event boundaries, and a
//! stream may end without a trailing blank line, in which case the
//! final partial chunk is still yielded.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Parsed form of a single SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: String,
    pub retry: u64,
}

/// One captured chunk with its raw bytes and timing.
#[derive(Debug, Clone)]
pub struct SseChunk {
    pub raw: Vec<u8>,
    pub event: SseEvent,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the previous chunk; 0 for the first.
    pub time_delta_ms: i64,
}

/// Parse the fields of one raw chunk. Comment lines (`:` prefix) and
/// unknown fields are skipped; repeated `data` lines are joined with
/// `\n`.
pub fn parse_event(raw: &[u8]) -> SseEvent {
    let mut event = SseEvent::default();
    for line in String::from_utf8_lossy(raw).lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field {
            "event" => event.event = value.to_owned(),
            "data" => {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(value);
            }
            "id" => event.id = value.to_owned(),
            "retry" => event.retry = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    event
}

/// Format an event back into wire form, terminated by a blank line.
pub fn format_event(event: &SseEvent) -> Vec<u8> {
    let mut out = String::new();
    if !event.event.is_empty() {
        out.push_str(&format!("event: {}\n", event.event));
    }
    if !event.id.is_empty() {
        out.push_str(&format!("id: {}\n", event.id));
    }
    if event.retry > 0 {
        out.push_str(&format!("retry: {}\n", event.retry));
    }
    for line in event.data.split('\n') {
        out.push_str(&format!("data: {line}\n"));
    }
    out.push('\n');
    out.into_bytes()
}

/// Incremental chunk decoder.
///
/// Feed arbitrary byte slices; completed chunks come back with their
/// inter-arrival timing. Call [`SseDecoder::finish`] at end of stream
/// to recover a final non-terminated chunk.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    chunk: Vec<u8>,
    last_chunk_at: Option<Instant>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            chunk: Vec::new(),
            last_chunk_at: None,
        }
    }

    /// Feed bytes from the stream, returning any chunks completed by
    /// this read.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseChunk> {
        self.pending.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let blank = line
                .iter()
                .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t');
            self.chunk.extend_from_slice(&line);

            // A blank line terminates a chunk, but never yields a chunk
            // consisting of the blank line alone.
            if blank && self.chunk.len() > line.len() {
                chunks.push(self.take_chunk());
            } else if blank {
                self.chunk.clear();
            }
        }
        chunks
    }

    /// End of stream: yield whatever is buffered, even without a
    /// terminating blank line.
    pub fn finish(mut self) -> Option<SseChunk> {
        self.chunk.extend_from_slice(&self.pending);
        if self.chunk.is_empty() {
            return None;
        }
        Some(self.take_chunk())
    }

    fn take_chunk(&mut self) -> SseChunk {
        let now = Instant::now();
        let time_delta_ms = self
            .last_chunk_at
            .map(|prev| now.duration_since(prev).as_millis() as i64)
            .unwrap_or(0);
        self.last_chunk_at = Some(now);

        let raw = std::mem::take(&mut self.chunk);
        let event = parse_event(&raw);
        SseChunk {
            raw,
            event,
            timestamp: Utc::now(),
            time_delta_ms,
        }
    }
}
