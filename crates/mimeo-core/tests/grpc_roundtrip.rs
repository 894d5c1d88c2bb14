//! End-to-end gRPC tests over real sockets
//!
//! The router is served behind an HTTP/2-capable listener and driven
//! with a real tonic client using the raw codec, covering the whole
//! byte-level path: routing, mock serving, and record-mode forwarding
//! (with a mock listener standing in as the upstream).

use std::sync::Arc;

use axum::Router;
use http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::Code;

use mimeo_core::config::{Mode, ProxyRoute, RouteProtocol};
use mimeo_core::events::NoOpObserver;
use mimeo_core::grpc::raw::{RawCodec, RawMessage};
use mimeo_core::grpc::{GrpcDestination, GrpcMock, GrpcProxy, GrpcRoute, GrpcRouter};
use mimeo_core::model::{Interaction, Protocol};
use mimeo_core::Store;

const FULL_METHOD: &str = "/com.example.user.UserService/GetUser";
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

async fn serve_router(router: GrpcRouter) -> u16 {
    let app = Router::new().fallback_service(router);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn grpc_unary(
    port: u16,
    full_method: &str,
    payload: &[u8],
) -> Result<RawMessage, tonic::Status> {
    let channel = Channel::from_shared(format!("http://127.0.0.1:{port}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.unwrap();

    let path = PathAndQuery::try_from(full_method.to_owned()).unwrap();
    grpc.unary(
        tonic::Request::new(RawMessage::new(payload.to_vec())),
        path,
        RawCodec,
    )
    .await
    .map(|response| response.into_inner())
}

/// Store seeded with one recorded unary exchange, served by a mock
/// route matching `com.example.*`.
async fn start_mock_listener(dir: &tempfile::TempDir, response_bytes: &[u8]) -> (Store, u16) {
    let store = Store::open(dir.path().join("mock.db")).unwrap();
    let route_config = ProxyRoute {
        session_name: "grpc-recordings".to_owned(),
        service_pattern: r"com\.example\..*".to_owned(),
        ..ProxyRoute::default()
    };

    let mock = GrpcMock::new("users", &route_config, store.clone(), Arc::new(NoOpObserver))
        .await
        .unwrap();

    let mut interaction = Interaction::new(Protocol::Grpc, FULL_METHOD, FULL_METHOD);
    interaction.session_id = mock.session().id;
    interaction.request_id = "grpc-seed-1".to_owned();
    interaction.request_headers = "{}".to_owned();
    interaction.request_body = b"request-frame".to_vec();
    interaction.response_status = 0;
    interaction.response_headers = r#"{"x-backend":["users-1"]}"#.to_owned();
    interaction.response_body = response_bytes.to_vec();
    store.record_interaction(interaction).await.unwrap();

    let route = GrpcRoute::new(
        "users",
        &route_config,
        GrpcDestination::Mock(Arc::new(mock)),
    )
    .unwrap();
    let port = serve_router(GrpcRouter::new(vec![route], MAX_MESSAGE_SIZE)).await;
    (store, port)
}

#[tokio::test]
async fn mock_listener_serves_recorded_frames() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, port) = start_mock_listener(&dir, b"response-frame").await;

    let response = grpc_unary(port, FULL_METHOD, b"anything").await.unwrap();
    assert_eq!(&response.data[..], b"response-frame");
}

#[tokio::test]
async fn unroutable_call_returns_unimplemented() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, port) = start_mock_listener(&dir, b"unused").await;

    let err = grpc_unary(port, "/other.pkg.Svc/GetThing", b"x")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn unrecorded_method_returns_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, port) = start_mock_listener(&dir, b"unused").await;

    let err = grpc_unary(port, "/com.example.user.UserService/DeleteUser", b"x")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn record_proxy_forwards_and_persists_unary_calls() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_upstream_store, upstream_port) = start_mock_listener(&dir, b"upstream-answer").await;

    // Record proxy targeting the mock listener as its upstream.
    let record_store = Store::open(dir.path().join("record.db")).unwrap();
    let route_config = ProxyRoute {
        target_host: "127.0.0.1".to_owned(),
        target_port: upstream_port,
        protocol: RouteProtocol::Grpc,
        session_name: "captured".to_owned(),
        is_default: true,
        ..ProxyRoute::default()
    };
    let proxy = GrpcProxy::new(
        "capture",
        route_config.clone(),
        Mode::Record,
        MAX_MESSAGE_SIZE,
        record_store.clone(),
        Arc::new(NoOpObserver),
    )
    .await
    .unwrap();
    let route = GrpcRoute::new(
        "capture",
        &route_config,
        GrpcDestination::Record(Arc::new(proxy)),
    )
    .unwrap();
    let port = serve_router(GrpcRouter::new(vec![route], MAX_MESSAGE_SIZE)).await;

    let response = grpc_unary(port, FULL_METHOD, b"live-request").await.unwrap();
    assert_eq!(&response.data[..], b"upstream-answer");

    let session = record_store.get_session("captured").await.unwrap();
    let interactions = record_store
        .get_interactions_by_session(session.id)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 1);
    let recorded = &interactions[0];
    assert_eq!(recorded.protocol, Protocol::Grpc);
    assert_eq!(recorded.method, FULL_METHOD);
    assert_eq!(recorded.endpoint, FULL_METHOD);
    assert_eq!(recorded.response_status, 0);
    assert_eq!(recorded.request_body, b"live-request");
    assert_eq!(recorded.response_body, b"upstream-answer");
    assert!(recorded.request_id.starts_with("grpc-"));
    assert_eq!(recorded.sequence_number, 1);
}
