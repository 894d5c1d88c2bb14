//! Core data model
//!
//! The persisted entities form a tree: a [`Session`] owns its
//! [`Interaction`]s, and a streaming interaction owns its ordered
//! [`StreamChunk`]s. Everything else in the system refers to these three
//! types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Wire protocol of a recorded interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "gRPC")]
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rest => "REST",
            Protocol::Grpc => "gRPC",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "REST" => Ok(Protocol::Rest),
            "gRPC" => Ok(Protocol::Grpc),
            other => Err(AppError::StorageError(format!(
                "unknown protocol tag: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named container for a sequence of interactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

/// One recorded request/response exchange.
///
/// `request_headers`, `response_headers` and `metadata` are serialized
/// JSON objects (`key -> joined value`); multi-value headers are joined
/// with `", "` before storage. A streaming interaction has an empty
/// `response_body` and one or more stream chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    pub session_id: i64,
    pub request_id: String,
    pub protocol: Protocol,
    pub method: String,
    pub endpoint: String,
    pub request_headers: String,
    #[serde(with = "serde_bytes_vec")]
    pub request_body: Vec<u8>,
    pub response_status: i32,
    pub response_headers: String,
    #[serde(with = "serde_bytes_vec")]
    pub response_body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// 1-based ordinal, unique per `(session, endpoint)`.
    pub sequence_number: i64,
    pub metadata: String,
    pub is_streaming: bool,
}

impl Interaction {
    /// Skeleton with storage-assigned fields zeroed. The store fills
    /// `id`, `sequence_number` and `timestamp` on insert.
    pub fn new(protocol: Protocol, method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: 0,
            session_id: 0,
            request_id: String::new(),
            protocol,
            method: method.into(),
            endpoint: endpoint.into(),
            request_headers: String::new(),
            request_body: Vec::new(),
            response_status: 0,
            response_headers: String::new(),
            response_body: Vec::new(),
            timestamp: Utc::now(),
            sequence_number: 0,
            metadata: String::new(),
            is_streaming: false,
        }
    }
}

/// One timed frame of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: i64,
    pub interaction_id: i64,
    /// 0-based, dense per interaction.
    pub chunk_index: i64,
    #[serde(with = "serde_bytes_vec")]
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the previous chunk of this interaction; 0 for
    /// the first.
    pub time_delta_ms: i64,
}

/// Serialize body bytes as a UTF-8 string when possible, falling back to
/// a byte array. Keeps JSON exports and websocket frames readable for
/// the common text-payload case.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(s) => ser.serialize_str(s),
            Err(_) => ser.collect_seq(bytes.iter()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Raw(Vec<u8>),
        }
        Ok(match Repr::deserialize(de)? {
            Repr::Text(s) => s.into_bytes(),
            Repr::Raw(b) => b,
        })
    }
}
