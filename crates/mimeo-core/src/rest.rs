//! REST request/response handling
//!
//! Turns live HTTP traffic into [`Interaction`] shapes and back:
//! header serialization (multi-value headers joined), redaction of
//! sensitive header content, and the path-level matching strategies
//! used by the mock engine.

use axum::http::{HeaderMap, Method};
use regex::Regex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::model::{Interaction, Protocol};

/// Literal substituted for every redaction-pattern match.
pub const REDACTED: &str = "[REDACTED]";

/// Stateless helper owned by the record and mock engines.
#[derive(Debug, Clone)]
pub struct RestHandler {
    redact_patterns: Vec<Regex>,
}

impl RestHandler {
    /// Compile the redaction patterns. Invalid patterns are fatal; they
    /// are caught by config validation before any engine is built.
    pub fn new(redact_patterns: &[String]) -> Result<Self> {
        let patterns = redact_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    AppError::ConfigError(format!("invalid redact pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            redact_patterns: patterns,
        })
    }

    /// Build an interaction skeleton from a live request. The body has
    /// already been buffered by the caller so it can still be forwarded.
    pub fn extract_request(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Interaction {
        let mut interaction = Interaction::new(Protocol::Rest, method.as_str(), path);
        interaction.request_id = Uuid::new_v4().to_string();
        interaction.request_headers = self.redact(&serialize_headers(headers));
        interaction.request_body = body.to_vec();
        interaction
    }

    /// Serialize and redact response headers.
    pub fn extract_response_headers(&self, headers: &HeaderMap) -> String {
        self.redact(&serialize_headers(headers))
    }

    /// Apply every redaction pattern, replacing matches with
    /// [`REDACTED`]. Applied symmetrically to recorded and live data so
    /// a recorded `[REDACTED]` matches any current value of the field.
    pub fn redact(&self, data: &str) -> String {
        let mut result = data.to_owned();
        for pattern in &self.redact_patterns {
            result = pattern.replace_all(&result, REDACTED).into_owned();
        }
        result
    }

    /// Method/path matching per strategy. Content comparison (headers,
    /// body) happens separately in the mock engine's fine match.
    pub fn match_request(
        &self,
        method: &str,
        path: &str,
        interaction: &Interaction,
        strategy: &str,
    ) -> bool {
        match strategy {
            "pattern" => self.pattern_match(method, path, interaction),
            "fuzzy" | "fuzzy-unordered" => self.fuzzy_match(method, path, interaction),
            _ => self.exact_match(method, path, interaction),
        }
    }

    fn exact_match(&self, method: &str, path: &str, interaction: &Interaction) -> bool {
        method == interaction.method && path == interaction.endpoint
    }

    /// The recorded endpoint is interpreted as a regex over the live
    /// path. A recorded endpoint that fails to compile matches nothing.
    fn pattern_match(&self, method: &str, path: &str, interaction: &Interaction) -> bool {
        if method != interaction.method {
            return false;
        }
        match Regex::new(&interaction.endpoint) {
            Ok(pattern) => pattern.is_match(path),
            Err(_) => false,
        }
    }

    /// Segment-wise comparison where differing segments are tolerated
    /// only when both sides look like identifiers (decimal integers or
    /// 36-char, 4-dash UUIDs).
    fn fuzzy_match(&self, method: &str, path: &str, interaction: &Interaction) -> bool {
        if method != interaction.method {
            return false;
        }

        let live: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let recorded: Vec<&str> = interaction
            .endpoint
            .trim_start_matches('/')
            .split('/')
            .collect();

        if live.len() != recorded.len() {
            return false;
        }

        live.iter().zip(recorded.iter()).all(|(a, b)| {
            a == b || (is_numeric_or_uuid(a) && is_numeric_or_uuid(b))
        })
    }
}

/// Serialize headers as a JSON object, joining repeated header values
/// with `", "`.
pub fn serialize_headers(headers: &HeaderMap) -> String {
    let mut map = serde_json::Map::new();
    for key in headers.keys() {
        let joined = headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(key.as_str().to_owned(), serde_json::Value::String(joined));
    }
    serde_json::Value::Object(map).to_string()
}

fn is_numeric_or_uuid(segment: &str) -> bool {
    if segment.len() == 36 && segment.matches('-').count() == 4 {
        return true;
    }
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// SSE detection on the response content type, case-insensitive.
pub fn is_sse_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/event-stream")
}
