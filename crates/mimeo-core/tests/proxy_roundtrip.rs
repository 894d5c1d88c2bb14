//! End-to-end engine tests against a local upstream
//!
//! Spins up a real HTTP server, records traffic through the record
//! engine, serves it back through the mock engine, and replays it with
//! validation. These cover the engine seams that unit tests cannot.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_stream::wrappers::ReceiverStream;

use mimeo_core::config::{ProxyRoute, RecordingConfig, ReplayConfig, RouteProtocol};
use mimeo_core::events::NoOpObserver;
use mimeo_core::mock::MockEngine;
use mimeo_core::record::RecordEngine;
use mimeo_core::replay::ReplayEngine;
use mimeo_core::{Store, ValidationStrategy};

async fn start_upstream() -> u16 {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/events", get(sse_events));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn sse_events() -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(4);
    tokio::spawn(async move {
        for i in 0..3 {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if tx
                .send(Ok(Bytes::from(format!("data: {i}\n\n"))))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

fn route_to(port: u16, session: &str, enable_streaming: bool) -> ProxyRoute {
    ProxyRoute {
        target_host: "127.0.0.1".to_owned(),
        target_port: port,
        protocol: RouteProtocol::Http,
        session_name: session.to_owned(),
        enable_streaming,
        ..ProxyRoute::default()
    }
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn record_then_mock_reproduces_the_response() {
    let upstream_port = start_upstream().await;
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    let recorder = RecordEngine::new(
        "api",
        route_to(upstream_port, "roundtrip", false),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();

    let recorded = recorder.handle(get_request("/health"), "test").await;
    assert_eq!(recorded.status(), 200);
    let recorded_body = axum::body::to_bytes(recorded.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&recorded_body[..], b"ok");

    let session = store.get_session("roundtrip").await.unwrap();
    let interactions = store.get_interactions_by_session(session.id).await.unwrap();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].endpoint, "/health");
    assert_eq!(interactions[0].response_status, 200);
    assert_eq!(interactions[0].sequence_number, 1);
    assert_eq!(interactions[0].response_body, b"ok");

    // Same request against the mock engine, upstream no longer needed.
    let mock = MockEngine::new(
        "api",
        &route_to(0, "roundtrip", false),
        Default::default(),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();

    let mocked = mock.handle(get_request("/health"), "test").await;
    assert_eq!(mocked.status(), 200);
    let mocked_body = axum::body::to_bytes(mocked.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(mocked_body, recorded_body);
}

#[tokio::test]
async fn sse_recording_captures_ordered_timed_chunks() {
    let upstream_port = start_upstream().await;
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    let recorder = RecordEngine::new(
        "sse",
        route_to(upstream_port, "sse-session", true),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();

    let response = recorder.handle(get_request("/events"), "test").await;
    assert_eq!(response.status(), 200);
    let streamed = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&streamed[..], b"data: 0\n\ndata: 1\n\ndata: 2\n\n");

    let session = store.get_session("sse-session").await.unwrap();
    let interactions = store.get_interactions_by_session(session.id).await.unwrap();
    assert_eq!(interactions.len(), 1);
    let interaction = &interactions[0];
    assert!(interaction.is_streaming);
    assert!(interaction.response_body.is_empty());

    // Chunk persistence happens after the stream completes.
    let mut chunks = Vec::new();
    for _ in 0..40 {
        chunks = store.get_stream_chunks(interaction.id).await.unwrap();
        if chunks.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(chunks.len(), 3);
    let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(chunks[0].data, b"data: 0\n\n");
    assert_eq!(chunks[0].time_delta_ms, 0);
    assert!(chunks[1].time_delta_ms >= 20);

    // Mock replay of the stream returns the same bytes.
    let mock = MockEngine::new(
        "sse",
        &route_to(0, "sse-session", true),
        Default::default(),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();
    let replayed = mock.handle(get_request("/events"), "test").await;
    let replayed_body = axum::body::to_bytes(replayed.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(replayed_body, streamed);
}

#[tokio::test]
async fn unreachable_upstream_yields_bad_gateway_and_no_recording() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    // Nothing listens on this port; binding and dropping reserves one
    // that is very likely closed.
    let closed_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let recorder = RecordEngine::new(
        "api",
        route_to(closed_port, "dead-upstream", false),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();

    let response = recorder.handle(get_request("/health"), "test").await;
    assert_eq!(response.status(), 502);

    let session = store.get_session("dead-upstream").await.unwrap();
    let interactions = store.get_interactions_by_session(session.id).await.unwrap();
    assert!(interactions.is_empty());
}

#[tokio::test]
async fn mock_streaming_respects_recorded_pacing() {
    use mimeo_core::config::MockConfig;
    use mimeo_core::model::{Interaction, Protocol, StreamChunk};

    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();
    let session = store.get_or_create_session("paced", "").await.unwrap();

    let mut interaction = Interaction::new(Protocol::Rest, "GET", "/events");
    interaction.session_id = session.id;
    interaction.request_id = "paced-0".to_owned();
    interaction.request_headers = "{}".to_owned();
    interaction.response_status = 200;
    interaction.response_headers = r#"{"content-type":"text/event-stream"}"#.to_owned();
    interaction.is_streaming = true;
    let recorded = store.record_interaction(interaction).await.unwrap();

    let chunks: Vec<StreamChunk> = (0..3)
        .map(|i| StreamChunk {
            id: 0,
            interaction_id: recorded.id,
            chunk_index: i,
            data: format!("data: {i}\n\n").into_bytes(),
            timestamp: chrono::Utc::now(),
            time_delta_ms: if i == 0 { 0 } else { 60 },
        })
        .collect();
    store.record_stream_chunks(chunks).await.unwrap();

    let mock = MockEngine::new(
        "sse",
        &route_to(0, "paced", true),
        MockConfig {
            respect_streaming_timing: true,
            ..MockConfig::default()
        },
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();

    let started = std::time::Instant::now();
    let response = mock.handle(get_request("/events"), "test").await;
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(&body[..], b"data: 0\n\ndata: 1\n\ndata: 2\n\n");
    // Two 60 ms gaps were replayed.
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn sequential_replay_reproduces_recorded_pacing() {
    use mimeo_core::model::{Interaction, Protocol};

    let upstream_port = start_upstream().await;
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    // Import preserves timestamps, unlike live recording.
    let base = chrono::Utc::now();
    let interactions: Vec<Interaction> = (0..2)
        .map(|i| {
            let mut interaction = Interaction::new(Protocol::Rest, "GET", "/health");
            interaction.request_id = format!("paced-{i}");
            interaction.request_headers = "{}".to_owned();
            interaction.response_status = 200;
            interaction.response_headers = "{}".to_owned();
            interaction.response_body = b"ok".to_vec();
            interaction.sequence_number = i + 1;
            interaction.timestamp = base + chrono::Duration::milliseconds(i * 200);
            interaction
        })
        .collect();
    store
        .import_interactions("timed-session", interactions)
        .await
        .unwrap();

    let replay_config = ReplayConfig {
        target_host: "127.0.0.1".to_owned(),
        target_port: upstream_port,
        protocol: RouteProtocol::Http,
        session_name: "timed-session".to_owned(),
        matching_strategy: ValidationStrategy::StatusCode,
        ..ReplayConfig::default()
    };

    let engine = ReplayEngine::new(replay_config, store).await.unwrap();
    let report = engine.replay().await.unwrap();
    assert_eq!(report.success_count, 2);
    // One recorded 200 ms gap between the two calls.
    assert!(report.duration_ms >= 150, "duration {}ms", report.duration_ms);
}

#[tokio::test]
async fn replay_flags_diverging_responses() {
    use mimeo_core::model::{Interaction, Protocol};

    let upstream_port = start_upstream().await;
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    // Recorded body differs from what the live upstream now returns.
    let mut interaction = Interaction::new(Protocol::Rest, "GET", "/health");
    interaction.request_id = "divergent-0".to_owned();
    interaction.request_headers = "{}".to_owned();
    interaction.response_status = 200;
    interaction.response_headers = "{}".to_owned();
    interaction.response_body = b"OK".to_vec();
    interaction.sequence_number = 1;
    store
        .import_interactions("divergent", vec![interaction])
        .await
        .unwrap();

    let replay_config = ReplayConfig {
        target_host: "127.0.0.1".to_owned(),
        target_port: upstream_port,
        protocol: RouteProtocol::Http,
        session_name: "divergent".to_owned(),
        matching_strategy: ValidationStrategy::Exact,
        ignore_timestamps: true,
        ..ReplayConfig::default()
    };

    let engine = ReplayEngine::new(replay_config, store.clone()).await.unwrap();
    let report = engine.replay().await.unwrap();
    assert_eq!(report.failure_count, 1);
    assert!(report.results[0]
        .validation_error
        .as_deref()
        .unwrap()
        .contains("body mismatch"));

    // The same session passes when only status codes are compared.
    let relaxed = ReplayConfig {
        target_host: "127.0.0.1".to_owned(),
        target_port: upstream_port,
        protocol: RouteProtocol::Http,
        session_name: "divergent".to_owned(),
        matching_strategy: ValidationStrategy::StatusCode,
        ignore_timestamps: true,
        ..ReplayConfig::default()
    };
    let engine = ReplayEngine::new(relaxed, store).await.unwrap();
    let report = engine.replay().await.unwrap();
    assert_eq!(report.failure_count, 0);
}

#[tokio::test]
async fn replay_validates_against_the_live_target() {
    let upstream_port = start_upstream().await;
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("recordings.db")).unwrap();

    let recorder = RecordEngine::new(
        "api",
        route_to(upstream_port, "replayable", false),
        &RecordingConfig::default(),
        store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();
    recorder.handle(get_request("/health"), "test").await;

    let replay_config = ReplayConfig {
        target_host: "127.0.0.1".to_owned(),
        target_port: upstream_port,
        protocol: RouteProtocol::Http,
        session_name: "replayable".to_owned(),
        matching_strategy: ValidationStrategy::Exact,
        ignore_timestamps: true,
        ..ReplayConfig::default()
    };

    let engine = ReplayEngine::new(replay_config, store).await.unwrap();
    let report = engine.replay().await.unwrap();
    assert_eq!(report.total_requests, 1);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 0);
    assert!(report.results[0].success);
    assert_eq!(report.results[0].actual_status, 200);
}
