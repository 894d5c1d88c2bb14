//! Observer interface for live traffic events
//!
//! Engines announce every recorded or mocked exchange through this
//! trait so a frontend (the web UI's websocket broadcaster, tests, or
//! nothing at all) can watch traffic without coupling the engines to
//! it. Implementations must be fail-open: emitting an event may never
//! stall or fail the proxied call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request observed by an engine, before it is answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub method: String,
    pub endpoint: String,
    pub session_name: String,
    pub remote_addr: String,
    pub request_id: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// The answer to a previously announced request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub method: String,
    pub endpoint: String,
    pub session_name: String,
    pub remote_addr: String,
    pub request_id: String,
    pub status: i32,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Passive event sink the engines may invoke.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn broadcast_request(&self, event: RequestEvent);
    async fn broadcast_response(&self, event: ResponseEvent);
}

/// Observer that drops everything; used when no frontend is attached.
#[derive(Debug, Default, Clone)]
pub struct NoOpObserver;

#[async_trait]
impl Observer for NoOpObserver {
    async fn broadcast_request(&self, _event: RequestEvent) {}
    async fn broadcast_response(&self, _event: ResponseEvent) {}
}

/// Parse a serialized header map back into the event form; invalid or
/// empty input becomes an empty map rather than an error.
pub fn headers_from_json(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_observer_accepts_events() {
        let observer = NoOpObserver;
        observer
            .broadcast_request(RequestEvent {
                method: "GET".into(),
                endpoint: "/x".into(),
                session_name: "s".into(),
                remote_addr: "127.0.0.1:1234".into(),
                request_id: "r-1".into(),
                headers: HashMap::new(),
                body: String::new(),
            })
            .await;
    }

    #[test]
    fn invalid_header_json_becomes_empty_map() {
        assert!(headers_from_json("not json").is_empty());
        assert!(headers_from_json("").is_empty());
        let map = headers_from_json(r#"{"Accept":"*/*"}"#);
        assert_eq!(map["Accept"], "*/*");
    }
}
