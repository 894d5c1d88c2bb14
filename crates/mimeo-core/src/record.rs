//! Record engine: forward upstream, capture, persist
//!
//! Each HTTP request is extracted into an interaction skeleton,
//! forwarded to the configured upstream, and persisted together with
//! the response. SSE responses are streamed to the client chunk by
//! chunk while being buffered with their timing, then written to the
//! store in one atomic batch. Storage failures never break the client's
//! flow; upstream failures surface as Bad Gateway and persist nothing.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::config::{ProxyRoute, RecordingConfig};
use crate::error::Result;
use crate::events::{headers_from_json, Observer, RequestEvent, ResponseEvent};
use crate::model::{Interaction, Session, StreamChunk};
use crate::rest::{is_sse_content_type, RestHandler};
use crate::sse::SseDecoder;
use crate::storage::Store;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_HEADERS: [&str; 4] = ["host", "connection", "transfer-encoding", "upgrade"];

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RecordEngine {
    route_name: String,
    route: ProxyRoute,
    store: Store,
    session: Session,
    rest: RestHandler,
    client: reqwest::Client,
    observer: Arc<dyn Observer>,
}

impl RecordEngine {
    pub async fn new(
        route_name: &str,
        route: ProxyRoute,
        recording: &RecordingConfig,
        store: Store,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let session = store
            .get_or_create_session(&route.session_name, "Proxy recording session")
            .await?;
        let rest = RestHandler::new(&recording.redact_patterns)?;

        // Decompression stays off so bodies are captured as received on
        // the wire.
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_UPSTREAM_TIMEOUT)
            .pool_max_idle_per_host(10)
            .no_gzip()
            .build()?;

        Ok(Self {
            route_name: route_name.to_owned(),
            route,
            store,
            session,
            rest,
            client,
            observer,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Proxy one HTTP request. The URI has already been stripped of the
    /// dispatcher's `/proxy/<name>` prefix.
    pub async fn handle(&self, req: Request<Body>, remote_addr: &str) -> Response {
        let (parts, body) = req.into_parts();
        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(route = %self.route_name, "failed to read request body: {e}");
                return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
            }
        };

        info!(route = %self.route_name, "[{}] {}", parts.method, parts.uri.path());

        let mut interaction = self.rest.extract_request(
            &parts.method,
            parts.uri.path(),
            &parts.headers,
            &body_bytes,
        );
        interaction.session_id = self.session.id;

        self.observer
            .broadcast_request(RequestEvent {
                method: interaction.method.clone(),
                endpoint: interaction.endpoint.clone(),
                session_name: self.session.name.clone(),
                remote_addr: remote_addr.to_owned(),
                request_id: interaction.request_id.clone(),
                headers: headers_from_json(&interaction.request_headers),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            })
            .await;

        let upstream = match self
            .forward(&parts.method, &parts.uri, &parts.headers, body_bytes)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                error!(route = %self.route_name, "error forwarding request: {e}");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            }
        };

        let content_type = upstream
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if self.route.enable_streaming && is_sse_content_type(content_type) {
            info!(
                route = %self.route_name,
                "streaming enabled, capturing SSE response for {} {}",
                interaction.method, interaction.endpoint
            );
            return self
                .handle_streaming_response(upstream, interaction, remote_addr)
                .await;
        }

        self.handle_buffered_response(upstream, interaction, remote_addr)
            .await
    }

    async fn forward(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let query = uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let target_url = format!(
            "{}://{}:{}{}{}",
            self.route.protocol.scheme(),
            self.route.target_host,
            self.route.target_port,
            uri.path(),
            query
        );

        let mut upstream_req = self.client.request(method.clone(), &target_url);
        for (name, value) in headers {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        if !body.is_empty() {
            upstream_req = upstream_req.body(body);
        }

        Ok(upstream_req.send().await?)
    }

    async fn handle_buffered_response(
        &self,
        upstream: reqwest::Response,
        mut interaction: Interaction,
        remote_addr: &str,
    ) -> Response {
        let status = upstream.status();
        let headers = upstream.headers().clone();

        let body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(route = %self.route_name, "error reading upstream body: {e}");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            }
        };

        interaction.response_status = status.as_u16() as i32;
        interaction.response_headers = self.rest.extract_response_headers(&headers);
        interaction.response_body = body.to_vec();

        self.observer
            .broadcast_response(ResponseEvent {
                method: interaction.method.clone(),
                endpoint: interaction.endpoint.clone(),
                session_name: self.session.name.clone(),
                remote_addr: remote_addr.to_owned(),
                request_id: interaction.request_id.clone(),
                status: interaction.response_status,
                headers: headers_from_json(&interaction.response_headers),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
            .await;

        match self.store.record_interaction(interaction).await {
            Ok(recorded) => info!(
                route = %self.route_name,
                "recorded interaction: {} {} -> {}",
                recorded.method, recorded.endpoint, recorded.response_status
            ),
            // The client still gets its response.
            Err(e) => error!(route = %self.route_name, "error recording interaction: {e}"),
        }

        copy_response(status, &headers, Body::from(body))
    }

    /// Persist the interaction row first, then relay chunks to the
    /// client as they arrive while buffering them for one atomic write
    /// after the stream ends.
    async fn handle_streaming_response(
        &self,
        upstream: reqwest::Response,
        mut interaction: Interaction,
        remote_addr: &str,
    ) -> Response {
        let status = upstream.status();
        let headers = upstream.headers().clone();

        interaction.response_status = status.as_u16() as i32;
        interaction.response_headers = self.rest.extract_response_headers(&headers);
        interaction.response_body = Vec::new();
        interaction.is_streaming = true;

        let interaction = match self.store.record_interaction(interaction).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(route = %self.route_name, "error recording streaming interaction: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    .into_response();
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(64);
        let store = self.store.clone();
        let observer = self.observer.clone();
        let route_name = self.route_name.clone();
        let session_name = self.session.name.clone();
        let remote_addr = remote_addr.to_owned();
        let interaction_id = interaction.id;
        let event_meta = (
            interaction.method.clone(),
            interaction.endpoint.clone(),
            interaction.request_id.clone(),
            interaction.response_headers.clone(),
        );

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut captured = Vec::new();
            let mut stream = upstream.bytes_stream();

            while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(route = %route_name, "upstream stream error: {e}");
                        break;
                    }
                };

                captured.extend(decoder.feed(&bytes));

                if tx.send(Ok(bytes)).await.is_err() {
                    // Client disconnected; keep whatever upstream already
                    // delivered and stop reading.
                    info!(
                        route = %route_name,
                        "client disconnected during streaming response ({} chunks captured)",
                        captured.len()
                    );
                    break;
                }
            }
            drop(tx);

            if let Some(tail) = decoder.finish() {
                captured.push(tail);
            }

            info!(route = %route_name, "captured {} streaming chunks", captured.len());

            let chunk_count = captured.len();
            let chunks: Vec<StreamChunk> = captured
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| StreamChunk {
                    id: 0,
                    interaction_id,
                    chunk_index: i as i64,
                    data: chunk.raw,
                    timestamp: chunk.timestamp,
                    time_delta_ms: chunk.time_delta_ms,
                })
                .collect();

            if let Err(e) = store.record_stream_chunks(chunks).await {
                error!(route = %route_name, "error recording stream chunks: {e}");
                // No chunks were persisted; the atomic batch rolled back.
                if let Err(e) = store.mark_interaction_as_partial(interaction_id, vec![]).await {
                    error!(route = %route_name, "error marking interaction as partial: {e}");
                }
            }

            let (method, endpoint, request_id, response_headers) = event_meta;
            observer
                .broadcast_response(ResponseEvent {
                    method,
                    endpoint,
                    session_name,
                    remote_addr,
                    request_id,
                    status: status.as_u16() as i32,
                    headers: headers_from_json(&response_headers),
                    body: format!("[Streaming response with {chunk_count} chunks]"),
                })
                .await;
        });

        copy_response(status, &headers, Body::from_stream(ReceiverStream::new(rx)))
    }
}

/// Copy status and headers from the upstream response, skipping
/// hop-by-hop headers the local transport manages itself.
fn copy_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if name.as_str() == "transfer-encoding" || name.as_str() == "connection" {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_response_drops_transport_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());

        let resp = copy_response(StatusCode::OK, &headers, Body::empty());
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("content-type"));
        assert!(!resp.headers().contains_key("transfer-encoding"));
        assert!(!resp.headers().contains_key("connection"));
    }
}
