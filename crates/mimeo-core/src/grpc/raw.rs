//! Pass-through gRPC codec
//!
//! Marshals a message by emitting its bytes unchanged and unmarshals by
//! copying the frame into a [`RawMessage`]. tonic handles the 5-byte
//! length-prefix framing; the codec only ever sees whole message
//! payloads.

use bytes::{Buf, BufMut, Bytes};
use chrono::Utc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// An opaque gRPC message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub data: Bytes,
}

impl RawMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// Codec registered for every proxied call in place of a
/// protobuf-generated one.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = RawMessage;
    type Decode = RawMessage;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = RawMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item.data);
        Ok(())
    }
}

#[derive(Debug)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = RawMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let data = src.copy_to_bytes(src.remaining());
        Ok(Some(RawMessage { data }))
    }
}

/// Opaque unique token for a gRPC interaction.
pub fn generate_request_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("grpc-{nanos}")
}

const STREAMING_NAME_HINTS: [&str; 6] =
    ["Stream", "Watch", "Subscribe", "Listen", "Monitor", "Observe"];

const UNARY_NAME_HINTS: [&str; 12] = [
    "Get", "Create", "Update", "Delete", "Check", "Validate", "Info", "Status", "Health", "Ping",
    "Version", "List",
];

/// Name-based unary/streaming classification.
///
/// Without descriptors the method name is the only signal available; a
/// name carrying a streaming hint wins over everything, a unary hint
/// wins next, and unknown names default to unary.
pub fn is_likely_unary(full_method: &str) -> bool {
    if STREAMING_NAME_HINTS.iter().any(|p| full_method.contains(p)) {
        return false;
    }
    if UNARY_NAME_HINTS.iter().any(|p| full_method.contains(p)) {
        return true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_hints_beat_unary_hints() {
        assert!(!is_likely_unary("/pkg.Svc/WatchStatus"));
        assert!(!is_likely_unary("/pkg.Svc/SubscribeEvents"));
        assert!(!is_likely_unary("/pkg.Svc/StreamLogs"));
    }

    #[test]
    fn unary_hints_classify_as_unary() {
        assert!(is_likely_unary("/pkg.Svc/GetUser"));
        assert!(is_likely_unary("/pkg.Svc/CreateOrder"));
        assert!(is_likely_unary("/pkg.Svc/HealthProbe"));
    }

    #[test]
    fn unknown_names_default_to_unary() {
        assert!(is_likely_unary("/pkg.Svc/Frobnicate"));
    }

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = generate_request_id();
        std::thread::sleep(std::time::Duration::from_nanos(100));
        let b = generate_request_id();
        assert!(a.starts_with("grpc-"));
        assert_ne!(a, b);
    }

    #[test]
    fn raw_message_wraps_bytes() {
        let msg = RawMessage::new(vec![1u8, 2, 3]);
        assert_eq!(&msg.data[..], &[1, 2, 3]);
    }
}
