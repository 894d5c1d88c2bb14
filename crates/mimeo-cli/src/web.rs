//! Web API and live-traffic websocket
//!
//! Serves the dashboard index, the JSON API over the store, and the
//! `/ws` endpoint that streams every recorded or mocked interaction as
//! it happens. The broadcaster implements the core observer trait with
//! a `tokio::sync::broadcast` channel: producers never block, and slow
//! websocket clients simply miss frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mimeo_core::events::{Observer, RequestEvent, ResponseEvent};
use mimeo_core::{AppError, Store};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

const INDEX_HTML: &str = include_str!("index.html");
const APP_CSS: &str = include_str!("static/app.css");

/// Fan-out of traffic events to connected websocket clients.
pub struct WsBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl WsBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Non-blocking send; events are dropped when nobody is listening
    /// or a receiver lags.
    fn emit<T: Serialize>(&self, event_type: &str, data: &T) {
        let frame = serde_json::json!({
            "type": event_type,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": data,
        });
        let _ = self.tx.send(frame.to_string());
    }
}

#[async_trait::async_trait]
impl Observer for WsBroadcaster {
    async fn broadcast_request(&self, event: RequestEvent) {
        self.emit("request", &event);
    }

    async fn broadcast_response(&self, event: ResponseEvent) {
        self.emit("response", &event);
    }
}

#[derive(Clone)]
pub struct WebState {
    pub store: Store,
    pub broadcaster: Arc<WsBroadcaster>,
    /// Advertised address of the gRPC listener, e.g. `0.0.0.0:9080`.
    pub grpc_address: String,
}

/// Routes for the UI, the JSON API and the websocket. Proxy routes are
/// mounted separately and take precedence by being more specific.
pub fn router(state: WebState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/", get(index))
        .route("/static/app.css", get(app_css))
        .route("/ws", get(ws_upgrade))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(session_interactions))
        .route("/api/interactions/", get(all_interactions))
        .route("/api/clear", post(clear_all))
        .route("/grpc/info", get(grpc_info))
        .with_state(state)
        .layer(cors)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn app_css() -> impl IntoResponse {
    ([("content-type", "text/css")], APP_CSS)
}

async fn ws_upgrade(State(state): State<WebState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    debug!("websocket client connected");
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("websocket client lagged, dropped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("websocket client disconnected");
}

async fn list_sessions(State(state): State<WebState>) -> Response {
    match state.store.list_sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(e),
    }
}

async fn session_interactions(
    State(state): State<WebState>,
    Path(session_id): Path<i64>,
) -> Response {
    match state.store.get_interactions_by_session(session_id).await {
        Ok(interactions) => Json(interactions).into_response(),
        Err(e) => error_response(e),
    }
}

async fn all_interactions(State(state): State<WebState>) -> Response {
    let sessions = match state.store.list_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => return error_response(e),
    };

    let mut interactions = Vec::new();
    for session in sessions {
        match state.store.get_interactions_by_session(session.id).await {
            Ok(mut batch) => interactions.append(&mut batch),
            Err(e) => return error_response(e),
        }
    }
    Json(interactions).into_response()
}

async fn clear_all(State(state): State<WebState>) -> Response {
    match state.store.clear_all().await {
        Ok(()) => Json(serde_json::json!({"status": "cleared"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn grpc_info(State(state): State<WebState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "protocol": "grpc",
        "grpc_address": state.grpc_address,
        "usage": format!("Connect your gRPC client to {}", state.grpc_address),
    }))
}

fn error_response(error: AppError) -> Response {
    let status = match &error {
        AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": error.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn web_state(dir: &TempDir) -> WebState {
        WebState {
            store: Store::open(dir.path().join("recordings.db")).unwrap(),
            broadcaster: Arc::new(WsBroadcaster::new()),
            grpc_address: "0.0.0.0:9080".to_owned(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn sessions_endpoint_lists_recorded_sessions() {
        let dir = TempDir::new().unwrap();
        let state = web_state(&dir);
        state
            .store
            .get_or_create_session("alpha", "first")
            .await
            .unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["name"], "alpha");
    }

    #[tokio::test]
    async fn clear_endpoint_empties_the_store() {
        let dir = TempDir::new().unwrap();
        let state = web_state(&dir);
        state
            .store
            .get_or_create_session("doomed", "")
            .await
            .unwrap();

        let app = router(state.clone());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grpc_info_advertises_the_listener_address() {
        let dir = TempDir::new().unwrap();
        let response = router(web_state(&dir))
            .oneshot(
                Request::builder()
                    .uri("/grpc/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = json_body(response).await;
        assert_eq!(json["grpc_address"], "0.0.0.0:9080");
        assert_eq!(json["protocol"], "grpc");
    }

    #[tokio::test]
    async fn index_serves_the_dashboard() {
        let dir = TempDir::new().unwrap();
        let response = router(web_state(&dir))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("mimeo"));
    }

    #[tokio::test]
    async fn broadcaster_delivers_frames_to_subscribers() {
        let broadcaster = WsBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster
            .broadcast_request(RequestEvent {
                method: "GET".into(),
                endpoint: "/x".into(),
                session_name: "s".into(),
                remote_addr: "t".into(),
                request_id: "r".into(),
                headers: Default::default(),
                body: String::new(),
            })
            .await;

        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["data"]["endpoint"], "/x");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn emitting_without_subscribers_does_not_block_or_fail() {
        let broadcaster = WsBroadcaster::new();
        broadcaster
            .broadcast_response(ResponseEvent {
                method: "GET".into(),
                endpoint: "/x".into(),
                session_name: "s".into(),
                remote_addr: "t".into(),
                request_id: "r".into(),
                status: 200,
                headers: Default::default(),
                body: String::new(),
            })
            .await;
    }
}
