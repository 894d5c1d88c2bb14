//! Pattern-based routing for incoming gRPC calls
//!
//! Mounted as the gRPC listener's catch-all service. Every call's
//! fully-qualified method is split into service and method names and
//! matched against the configured routes: the first non-default route
//! whose set patterns all match wins, the default route catches the
//! rest, and anything else is answered with `Unimplemented`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use regex::Regex;
use tonic::{Code, Status, Streaming};
use tracing::{info, warn};

use crate::config::{compile_optional_pattern, ProxyRoute};
use crate::error::{AppError, Result};
use crate::grpc::mock::GrpcMock;
use crate::grpc::proxy::GrpcProxy;
use crate::grpc::raw::{is_likely_unary, RawCodec, RawMessage};
use crate::grpc::split_full_method;

/// Engine a route hands its calls to.
#[derive(Clone)]
pub enum GrpcDestination {
    Record(Arc<GrpcProxy>),
    Mock(Arc<GrpcMock>),
}

pub struct GrpcRoute {
    pub name: String,
    service_pattern: Option<Regex>,
    method_pattern: Option<Regex>,
    pub is_default: bool,
    destination: GrpcDestination,
}

impl GrpcRoute {
    pub fn new(name: &str, config: &ProxyRoute, destination: GrpcDestination) -> Result<Self> {
        let service_pattern = compile_optional_pattern(&config.service_pattern).map_err(|e| {
            AppError::ConfigError(format!("invalid service pattern for route '{name}': {e}"))
        })?;
        let method_pattern = compile_optional_pattern(&config.method_pattern).map_err(|e| {
            AppError::ConfigError(format!("invalid method pattern for route '{name}': {e}"))
        })?;

        if service_pattern.is_none() && method_pattern.is_none() && !config.is_default {
            warn!("gRPC route '{name}' has no patterns and matches every call");
        }

        Ok(Self {
            name: name.to_owned(),
            service_pattern,
            method_pattern,
            is_default: config.is_default,
            destination,
        })
    }

    /// Patterns that are set must all match; a pattern-less route
    /// matches everything.
    fn matches(&self, service: &str, method: &str) -> bool {
        if let Some(pattern) = &self.service_pattern {
            if !pattern.is_match(service) {
                return false;
            }
        }
        if let Some(pattern) = &self.method_pattern {
            if !pattern.is_match(method) {
                return false;
            }
        }
        true
    }
}

struct RouterInner {
    routes: Vec<GrpcRoute>,
    default_route: Option<GrpcRoute>,
    max_message_size: usize,
}

/// Cloneable handle mounted as the gRPC listener's fallback service.
#[derive(Clone)]
pub struct GrpcRouter {
    inner: Arc<RouterInner>,
}

impl GrpcRouter {
    pub fn new(routes: Vec<GrpcRoute>, max_message_size: usize) -> Self {
        let mut default_route = None;
        let mut ordered = Vec::new();
        for route in routes {
            info!(
                "added gRPC route '{}'{}",
                route.name,
                if route.is_default { " (default)" } else { "" }
            );
            if route.is_default {
                default_route = Some(route);
            } else {
                ordered.push(route);
            }
        }
        Self {
            inner: Arc::new(RouterInner {
                routes: ordered,
                default_route,
                max_message_size,
            }),
        }
    }

    /// First matching non-default route, else the default.
    pub fn find_route(&self, service: &str, method: &str) -> Option<&GrpcRoute> {
        self.inner
            .routes
            .iter()
            .find(|route| route.matches(service, method))
            .or(self.inner.default_route.as_ref())
    }

    pub async fn dispatch(&self, req: http::Request<Body>) -> http::Response<Body> {
        let path = req.uri().path().to_owned();

        let Some((service, method)) = split_full_method(&path) else {
            return grpc_error_response(
                Code::InvalidArgument,
                &format!("invalid method name format: {path}"),
            );
        };

        let Some(route) = self.find_route(service, method) else {
            return grpc_error_response(
                Code::Unimplemented,
                &format!("no route found for service {service} method {method}"),
            );
        };
        info!("gRPC router: matched route '{}' for {}", route.name, path);

        let limit = self.inner.max_message_size;
        let mut grpc = tonic::server::Grpc::new(RawCodec)
            .apply_max_message_size_config(Some(limit), Some(limit));

        let response = match &route.destination {
            GrpcDestination::Record(proxy) => {
                if is_likely_unary(&path) {
                    grpc.unary(
                        ProxyUnarySvc {
                            proxy: proxy.clone(),
                            method: path,
                        },
                        req,
                    )
                    .await
                } else {
                    grpc.streaming(
                        ProxyStreamingSvc {
                            proxy: proxy.clone(),
                            method: path,
                        },
                        req,
                    )
                    .await
                }
            }
            GrpcDestination::Mock(mock) => {
                grpc.unary(
                    MockUnarySvc {
                        mock: mock.clone(),
                        method: path,
                    },
                    req,
                )
                .await
            }
        };

        response.map(Body::new)
    }
}

impl tower::Service<http::Request<Body>> for GrpcRouter {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.dispatch(req).await) })
    }
}

/// Terminal gRPC error as an HTTP response, the way a server answers
/// calls that never reach a handler.
fn grpc_error_response(code: Code, message: &str) -> http::Response<Body> {
    let message: String = message
        .chars()
        .map(|c| if c.is_ascii() && c != '\n' && c != '\r' { c } else { ' ' })
        .collect();
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header("content-type", "application/grpc")
        .header("grpc-status", (code as i32).to_string())
        .header("grpc-message", message)
        .body(Body::empty())
        .unwrap_or_else(|_| http::Response::new(Body::empty()))
}

struct ProxyUnarySvc {
    proxy: Arc<GrpcProxy>,
    method: String,
}

impl tonic::server::UnaryService<RawMessage> for ProxyUnarySvc {
    type Response = RawMessage;
    type Future = Pin<
        Box<
            dyn Future<Output = std::result::Result<tonic::Response<RawMessage>, Status>> + Send,
        >,
    >;

    fn call(&mut self, request: tonic::Request<RawMessage>) -> Self::Future {
        let proxy = self.proxy.clone();
        let method = self.method.clone();
        Box::pin(async move { proxy.handle_unary(&method, request).await })
    }
}

struct ProxyStreamingSvc {
    proxy: Arc<GrpcProxy>,
    method: String,
}

impl tonic::server::StreamingService<RawMessage> for ProxyStreamingSvc {
    type Response = RawMessage;
    type ResponseStream = Streaming<RawMessage>;
    type Future = Pin<
        Box<
            dyn Future<Output = std::result::Result<tonic::Response<Self::ResponseStream>, Status>>
                + Send,
        >,
    >;

    fn call(&mut self, request: tonic::Request<Streaming<RawMessage>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let method = self.method.clone();
        Box::pin(async move { proxy.handle_streaming(&method, request).await })
    }
}

struct MockUnarySvc {
    mock: Arc<GrpcMock>,
    method: String,
}

impl tonic::server::UnaryService<RawMessage> for MockUnarySvc {
    type Response = RawMessage;
    type Future = Pin<
        Box<
            dyn Future<Output = std::result::Result<tonic::Response<RawMessage>, Status>> + Send,
        >,
    >;

    fn call(&mut self, request: tonic::Request<RawMessage>) -> Self::Future {
        let mock = self.mock.clone();
        let method = self.method.clone();
        Box::pin(async move { mock.handle_unary(&method, request).await })
    }
}
