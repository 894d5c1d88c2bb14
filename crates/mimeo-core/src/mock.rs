//! Mock engine: serve recorded responses without an upstream
//!
//! Candidates are looked up by `(session, method, path)`, narrowed by
//! the request-content fine match for the active strategy, and selected
//! with a per-signature sequence cursor so repeated identical calls
//! cycle deterministically through the recordings. Streaming recordings
//! are replayed chunk by chunk, optionally with their recorded pacing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use crate::config::{MockConfig, ProxyRoute, RecordingConfig, SequenceMode};
use crate::error::Result;
use crate::events::{headers_from_json, Observer, RequestEvent, ResponseEvent};
use crate::matching::{bodies_match, headers_match};
use crate::model::{Interaction, Session};
use crate::rest::{serialize_headers, RestHandler};
use crate::storage::Store;

pub struct MockEngine {
    route_name: String,
    mock_config: MockConfig,
    store: Store,
    session: Session,
    rest: RestHandler,
    /// `request signature -> last served sequence_number`. Held only for
    /// the read-modify-write of the cursor, never across I/O.
    sequence_state: Arc<RwLock<HashMap<String, i64>>>,
    observer: Arc<dyn Observer>,
}

impl MockEngine {
    pub async fn new(
        route_name: &str,
        route: &ProxyRoute,
        mock_config: MockConfig,
        recording: &RecordingConfig,
        store: Store,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let session = store
            .get_or_create_session(&route.session_name, "Mock session")
            .await?;
        let rest = RestHandler::new(&recording.redact_patterns)?;

        Ok(Self {
            route_name: route_name.to_owned(),
            mock_config,
            store,
            session,
            rest,
            sequence_state: Arc::new(RwLock::new(HashMap::new())),
            observer,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Serve one request from the recordings.
    pub async fn handle(&self, req: Request<Body>, remote_addr: &str) -> Response {
        let (parts, body) = req.into_parts();
        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(route = %self.route_name, "failed to read request body: {e}");
                return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
            }
        };

        let method = parts.method.as_str().to_owned();
        let path = parts.uri.path().to_owned();
        info!(route = %self.route_name, "[MOCK] {method} {path}");

        let current_headers = self.rest.redact(&serialize_headers(&parts.headers));

        self.observer
            .broadcast_request(RequestEvent {
                method: method.clone(),
                endpoint: path.clone(),
                session_name: self.session.name.clone(),
                remote_addr: remote_addr.to_owned(),
                request_id: String::new(),
                headers: headers_from_json(&current_headers),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            })
            .await;

        let candidates = match self
            .store
            .find_matching_interactions(self.session.id, &method, &path)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(route = %self.route_name, "error finding matching interactions: {e}");
                return self.not_found_response();
            }
        };

        if candidates.is_empty() {
            info!(route = %self.route_name, "no recorded interactions for {method} {path}");
            return self.not_found_response();
        }

        let matching: Vec<Interaction> = candidates
            .into_iter()
            .filter(|interaction| self.matches_request_content(interaction, &current_headers, &body_bytes))
            .collect();

        if matching.is_empty() {
            info!(
                route = %self.route_name,
                "no interactions match request content for {method} {path}"
            );
            return self.not_found_response();
        }

        let selected = match self.mock_config.sequence_mode {
            SequenceMode::Ordered => {
                self.select_sequential(&matching, &method, &path, &current_headers, &body_bytes)
            }
            SequenceMode::Random => self.select_first_match(&matching, &method, &path),
        };

        self.observer
            .broadcast_response(ResponseEvent {
                method: selected.method.clone(),
                endpoint: selected.endpoint.clone(),
                session_name: self.session.name.clone(),
                remote_addr: remote_addr.to_owned(),
                request_id: selected.request_id.clone(),
                status: selected.response_status,
                headers: headers_from_json(&selected.response_headers),
                body: String::from_utf8_lossy(&selected.response_body).into_owned(),
            })
            .await;

        info!(
            route = %self.route_name,
            "served mock response: {} {} -> {} (sequence {})",
            selected.method, selected.endpoint, selected.response_status, selected.sequence_number
        );

        self.send_response(&selected).await
    }

    fn matches_request_content(
        &self,
        interaction: &Interaction,
        current_headers: &str,
        current_body: &[u8],
    ) -> bool {
        let strategy = self.mock_config.matching_strategy;
        let ignore = &self.mock_config.fuzzy_ignore_fields;

        if !headers_match(
            &interaction.request_headers,
            current_headers,
            strategy,
            ignore,
            &self.rest,
        ) {
            debug!(sequence = interaction.sequence_number, "headers do not match");
            return false;
        }

        if !bodies_match(&interaction.request_body, current_body, strategy, ignore) {
            debug!(sequence = interaction.sequence_number, "body does not match");
            return false;
        }

        true
    }

    /// Pick the first candidate past the cursor for this signature,
    /// wrapping to the first recording when the end is reached.
    fn select_sequential(
        &self,
        candidates: &[Interaction],
        method: &str,
        path: &str,
        redacted_headers: &str,
        body: &[u8],
    ) -> Interaction {
        let signature = format!(
            "{method}:{path}:{redacted_headers}:{}",
            String::from_utf8_lossy(body)
        );

        let mut state = self.sequence_state.write().expect("cursor lock poisoned");
        let last = state.get(&signature).copied().unwrap_or(0);

        let selected = candidates
            .iter()
            .find(|candidate| candidate.sequence_number > last)
            .unwrap_or(&candidates[0]);
        state.insert(signature, selected.sequence_number);
        selected.clone()
    }

    /// Selection for the non-cursor mode: first candidate whose
    /// method/path matches exactly, else the first candidate.
    fn select_first_match(
        &self,
        candidates: &[Interaction],
        method: &str,
        path: &str,
    ) -> Interaction {
        candidates
            .iter()
            .find(|candidate| self.rest.match_request(method, path, candidate, "exact"))
            .unwrap_or(&candidates[0])
            .clone()
    }

    async fn send_response(&self, interaction: &Interaction) -> Response {
        if interaction.is_streaming {
            return self.send_streaming_response(interaction).await;
        }

        let status =
            StatusCode::from_u16(interaction.response_status as u16).unwrap_or(StatusCode::OK);
        let mut builder = Response::builder().status(status);
        for (name, value) in parse_response_headers(&interaction.response_headers) {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(interaction.response_body.clone()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// Replay the recorded chunks, flushed one by one. With
    /// `respect_streaming_timing` each chunk waits out its recorded
    /// inter-arrival delay first.
    async fn send_streaming_response(&self, interaction: &Interaction) -> Response {
        let chunks = match self.store.get_stream_chunks(interaction.id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(route = %self.route_name, "error loading stream chunks: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    .into_response();
            }
        };

        info!(
            route = %self.route_name,
            "replaying streaming response: {} {} -> {} chunks",
            interaction.method, interaction.endpoint, chunks.len()
        );

        let respect_timing = self.mock_config.respect_streaming_timing;
        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(16);
        tokio::spawn(async move {
            for chunk in chunks {
                if respect_timing && chunk.time_delta_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(chunk.time_delta_ms as u64)).await;
                }
                if tx.send(Ok(Bytes::from(chunk.data))).await.is_err() {
                    break;
                }
            }
        });

        let status =
            StatusCode::from_u16(interaction.response_status as u16).unwrap_or(StatusCode::OK);
        let mut builder = Response::builder().status(status);
        for (name, value) in parse_response_headers(&interaction.response_headers) {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    fn not_found_response(&self) -> Response {
        let config = &self.mock_config.not_found_response;
        let status = StatusCode::from_u16(config.status).unwrap_or(StatusCode::NOT_FOUND);
        let body = config.body.to_string();
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::NOT_FOUND.into_response())
    }

    /// Forget all cursors; the next call on every signature starts from
    /// the first recording again.
    pub fn reset_sequence_state(&self) {
        self.sequence_state
            .write()
            .expect("cursor lock poisoned")
            .clear();
        info!(route = %self.route_name, "reset mock sequence state");
    }

    /// Snapshot of the cursor map.
    pub fn sequence_state(&self) -> HashMap<String, i64> {
        self.sequence_state
            .read()
            .expect("cursor lock poisoned")
            .clone()
    }
}

fn parse_response_headers(raw: &str) -> Vec<(HeaderName, HeaderValue)> {
    let map: HashMap<String, String> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(_) => return Vec::new(),
    };
    map.into_iter()
        .filter_map(|(name, value)| {
            let name = HeaderName::try_from(name).ok()?;
            let value = HeaderValue::try_from(value).ok()?;
            Some((name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingStrategy;
    use crate::events::NoOpObserver;
    use crate::model::{Protocol, StreamChunk};
    use tempfile::TempDir;

    async fn engine_with(
        mock_config: MockConfig,
        session_name: &str,
    ) -> (TempDir, Store, MockEngine) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("recordings.db")).unwrap();
        let route = ProxyRoute {
            session_name: session_name.to_owned(),
            ..ProxyRoute::default()
        };
        let engine = MockEngine::new(
            "test",
            &route,
            mock_config,
            &RecordingConfig::default(),
            store.clone(),
            Arc::new(NoOpObserver),
        )
        .await
        .unwrap();
        (dir, store, engine)
    }

    async fn record(
        store: &Store,
        session_id: i64,
        request_id: &str,
        method: &str,
        endpoint: &str,
        body: &[u8],
        status: i32,
    ) {
        let mut interaction = Interaction::new(Protocol::Rest, method, endpoint);
        interaction.session_id = session_id;
        interaction.request_id = request_id.to_owned();
        interaction.request_headers = "{}".to_owned();
        interaction.request_body = body.to_vec();
        interaction.response_status = status;
        interaction.response_headers = r#"{"content-type":"text/plain"}"#.to_owned();
        interaction.response_body = format!("status-{status}").into_bytes();
        store.record_interaction(interaction.clone()).await.unwrap();
    }

    fn request(method: &str, path: &str, body: &[u8]) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    async fn status_of(engine: &MockEngine, method: &str, path: &str, body: &[u8]) -> u16 {
        engine
            .handle(request(method, path, body), "test-client")
            .await
            .status()
            .as_u16()
    }

    #[tokio::test]
    async fn sequence_cursor_cycles_through_candidates() {
        let (_dir, store, engine) = engine_with(MockConfig::default(), "cursor").await;
        let session_id = engine.session().id;
        for (i, status) in [201, 202, 203].iter().enumerate() {
            record(&store, session_id, &format!("r-{i}"), "GET", "/poll", b"", *status).await;
        }

        let mut served = Vec::new();
        for _ in 0..4 {
            served.push(status_of(&engine, "GET", "/poll", b"").await);
        }
        assert_eq!(served, vec![201, 202, 203, 201]);
    }

    #[tokio::test]
    async fn missing_recording_yields_configured_not_found() {
        let (_dir, _store, engine) = engine_with(MockConfig::default(), "empty").await;
        let resp = engine.handle(request("GET", "/nothing", b""), "t").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Recording not found");
    }

    #[tokio::test]
    async fn fuzzy_strategy_tolerates_uuid_swaps_only() {
        let mock_config = MockConfig {
            matching_strategy: MatchingStrategy::Fuzzy,
            ..MockConfig::default()
        };
        let (_dir, store, engine) = engine_with(mock_config, "fuzzy").await;
        let session_id = engine.session().id;
        record(
            &store,
            session_id,
            "u-0",
            "POST",
            "/users",
            br#"{"id":"11111111-2222-3333-4444-555555555555","name":"A"}"#,
            200,
        )
        .await;

        let fresh_uuid = br#"{"id":"ffffffff-ffff-ffff-ffff-ffffffffffff","name":"A"}"#;
        assert_eq!(status_of(&engine, "POST", "/users", fresh_uuid).await, 200);

        let changed_name = br#"{"id":"ffffffff-ffff-ffff-ffff-ffffffffffff","name":"B"}"#;
        assert_eq!(status_of(&engine, "POST", "/users", changed_name).await, 404);
    }

    #[tokio::test]
    async fn exact_strategy_requires_identical_body() {
        let (_dir, store, engine) = engine_with(MockConfig::default(), "exact").await;
        let session_id = engine.session().id;
        record(&store, session_id, "e-0", "POST", "/orders", b"payload", 200).await;

        assert_eq!(status_of(&engine, "POST", "/orders", b"payload").await, 200);
        assert_eq!(status_of(&engine, "POST", "/orders", b"other").await, 404);
    }

    #[tokio::test]
    async fn recorded_headers_are_replayed() {
        let (_dir, store, engine) = engine_with(MockConfig::default(), "headers").await;
        record(&store, engine.session().id, "h-0", "GET", "/h", b"", 200).await;

        let resp = engine.handle(request("GET", "/h", b""), "t").await;
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn reset_sequence_state_restarts_the_cycle() {
        let (_dir, store, engine) = engine_with(MockConfig::default(), "reset").await;
        let session_id = engine.session().id;
        record(&store, session_id, "s-0", "GET", "/seq", b"", 201).await;
        record(&store, session_id, "s-1", "GET", "/seq", b"", 202).await;

        assert_eq!(status_of(&engine, "GET", "/seq", b"").await, 201);
        assert_eq!(status_of(&engine, "GET", "/seq", b"").await, 202);
        assert!(!engine.sequence_state().is_empty());

        engine.reset_sequence_state();
        assert_eq!(status_of(&engine, "GET", "/seq", b"").await, 201);
    }

    #[tokio::test]
    async fn streaming_recordings_replay_their_chunks() {
        let (_dir, store, engine) = engine_with(MockConfig::default(), "stream").await;
        let session_id = engine.session().id;

        let mut interaction = Interaction::new(Protocol::Rest, "GET", "/events");
        interaction.session_id = session_id;
        interaction.request_id = "sse-0".to_owned();
        interaction.request_headers = "{}".to_owned();
        interaction.response_status = 200;
        interaction.response_headers =
            r#"{"content-type":"text/event-stream"}"#.to_owned();
        interaction.is_streaming = true;
        let recorded = store.record_interaction(interaction).await.unwrap();

        let chunks: Vec<StreamChunk> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, data)| StreamChunk {
                id: 0,
                interaction_id: recorded.id,
                chunk_index: i as i64,
                data: format!("data: {data}\n\n").into_bytes(),
                timestamp: chrono::Utc::now(),
                time_delta_ms: 0,
            })
            .collect();
        store.record_stream_chunks(chunks).await.unwrap();

        let resp = engine.handle(request("GET", "/events", b""), "t").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data: a\n\ndata: b\n\ndata: c\n\n");
    }
}
