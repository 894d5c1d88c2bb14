//! Multi-proxy dispatcher
//!
//! One HTTP listener carries the web UI/API plus every HTTP route under
//! `/proxy/<name>/…` (the prefix is stripped before the engine sees the
//! request); a second listener carries all gRPC routes behind the
//! pattern router. Both shut down gracefully on ctrl-c.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, Uri};
use axum::response::Response;
use axum::Router;
use mimeo_core::events::Observer;
use mimeo_core::grpc::{GrpcDestination, GrpcMock, GrpcProxy, GrpcRoute, GrpcRouter};
use mimeo_core::{Config, MockEngine, Mode, RecordEngine, Store};
use tokio::net::TcpListener;
use tracing::info;

use crate::web::{self, WebState, WsBroadcaster};

/// Engine behind one HTTP proxy route.
#[derive(Clone)]
enum HttpEngine {
    Record(Arc<RecordEngine>),
    Mock(Arc<MockEngine>),
}

impl HttpEngine {
    async fn handle(&self, req: Request<Body>, remote_addr: &str) -> Response {
        match self {
            HttpEngine::Record(engine) => engine.handle(req, remote_addr).await,
            HttpEngine::Mock(engine) => engine.handle(req, remote_addr).await,
        }
    }
}

/// Tower service mounted at `/proxy/<name>`; rewrites the URI so the
/// engine sees the upstream-relative path.
#[derive(Clone)]
struct ProxyService {
    prefix: String,
    engine: HttpEngine,
}

impl tower::Service<Request<Body>> for ProxyService {
    type Response = Response;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            let remote_addr = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.to_string())
                .unwrap_or_else(|| "unknown".to_owned());

            *req.uri_mut() = strip_route_prefix(req.uri(), &service.prefix);
            Ok(service.engine.handle(req, &remote_addr).await)
        })
    }
}

fn strip_route_prefix(uri: &Uri, prefix: &str) -> Uri {
    let path = uri.path().strip_prefix(prefix).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };
    let rewritten = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    rewritten.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

pub struct MultiProxyServer {
    config: Config,
    store: Store,
}

impl MultiProxyServer {
    pub fn new(config: Config, store: Store) -> Self {
        Self { config, store }
    }

    /// Build every configured engine, mount the listeners and serve
    /// until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let broadcaster = Arc::new(WsBroadcaster::new());
        let observer: Arc<dyn Observer> = broadcaster.clone();
        let mode = self.config.mode;

        let grpc_address = format!(
            "{}:{}",
            self.config.server.listen_host, self.config.server.grpc_port
        );

        let mut app = web::router(WebState {
            store: self.store.clone(),
            broadcaster: broadcaster.clone(),
            grpc_address: grpc_address.clone(),
        });

        let mut grpc_routes = Vec::new();
        let mut http_route_count = 0usize;

        for (name, route) in &self.config.proxies {
            if route.protocol.is_grpc() {
                let destination = match mode {
                    Mode::Mock => GrpcDestination::Mock(Arc::new(
                        GrpcMock::new(name, route, self.store.clone(), observer.clone()).await?,
                    )),
                    _ => GrpcDestination::Record(Arc::new(
                        GrpcProxy::new(
                            name,
                            route.clone(),
                            mode,
                            self.config.grpc.max_message_size,
                            self.store.clone(),
                            observer.clone(),
                        )
                        .await?,
                    )),
                };
                grpc_routes.push(GrpcRoute::new(name, route, destination)?);

                // HTTP-side discovery endpoint for this gRPC route.
                let info = serde_json::json!({
                    "message": "This is a gRPC proxy endpoint",
                    "protocol": "grpc",
                    "grpc_address": grpc_address.clone(),
                    "usage": format!("Connect your gRPC client to {grpc_address}"),
                });
                app = app.route(
                    &format!("/proxy/{name}"),
                    axum::routing::any(move || async move { axum::Json(info) }),
                );
                info!("initialized gRPC proxy '{name}' in {mode:?} mode");
            } else {
                let engine = match mode {
                    Mode::Mock => HttpEngine::Mock(Arc::new(
                        MockEngine::new(
                            name,
                            route,
                            self.config.mock.clone(),
                            &self.config.recording,
                            self.store.clone(),
                            observer.clone(),
                        )
                        .await?,
                    )),
                    _ => HttpEngine::Record(Arc::new(
                        RecordEngine::new(
                            name,
                            route.clone(),
                            &self.config.recording,
                            self.store.clone(),
                            observer.clone(),
                        )
                        .await?,
                    )),
                };

                let service = ProxyService {
                    prefix: format!("/proxy/{name}"),
                    engine,
                };
                // Proxy routes are more specific than the UI routes, so
                // /proxy/… always wins.
                app = app
                    .route_service(&format!("/proxy/{name}"), service.clone())
                    .route_service(&format!("/proxy/{name}/*rest"), service);
                info!("initialized HTTP proxy '{name}' in {mode:?} mode at /proxy/{name}/");
                http_route_count += 1;
            }
        }

        let grpc_task = if grpc_routes.is_empty() {
            None
        } else {
            let router = GrpcRouter::new(grpc_routes, self.config.grpc.max_message_size);
            let grpc_app = Router::new().fallback_service(router);
            let listener = TcpListener::bind(&grpc_address)
                .await
                .with_context(|| format!("bind gRPC listener on {grpc_address}"))?;
            info!("gRPC proxies listening on {grpc_address}");
            Some(tokio::spawn(async move {
                axum::serve(listener, grpc_app.into_make_service())
                    .with_graceful_shutdown(shutdown_signal())
                    .await
            }))
        };

        let http_address = format!(
            "{}:{}",
            self.config.server.listen_host, self.config.server.listen_port
        );
        let listener = TcpListener::bind(&http_address)
            .await
            .with_context(|| format!("bind HTTP listener on {http_address}"))?;

        info!("web UI available at http://{http_address}/");
        if http_route_count > 0 {
            info!("HTTP proxies ({http_route_count}) available at http://{http_address}/proxy/<name>/");
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

        if let Some(task) = grpc_task {
            task.await?.context("gRPC server failed")?;
        }

        info!("shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}
