//! Record/forward engine for gRPC calls
//!
//! Dialed per call, like the HTTP record path: the upstream connection
//! uses TLS when the target port is 443 or the route protocol says so,
//! plaintext otherwise. Unary calls are recorded with their request and
//! response bytes plus the numeric gRPC status; streaming calls are
//! proxied bidirectionally until either side ends, which is as far as
//! recording goes for them.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Code, Status, Streaming};
use tracing::{debug, error, info};

use crate::config::{Mode, ProxyRoute, RouteProtocol};
use crate::error::Result;
use crate::events::{Observer, RequestEvent, ResponseEvent};
use crate::grpc::raw::{generate_request_id, RawCodec, RawMessage};
use crate::grpc::metadata_to_json;
use crate::model::{Interaction, Protocol, Session};
use crate::storage::Store;

/// Peer label used in observer events; gRPC streams do not expose a
/// client address through tonic.
const GRPC_CLIENT_ADDR: &str = "grpc-client";

pub struct GrpcProxy {
    route_name: String,
    route: ProxyRoute,
    mode: Mode,
    store: Store,
    session: Session,
    observer: Arc<dyn Observer>,
    max_message_size: usize,
}

impl GrpcProxy {
    pub async fn new(
        route_name: &str,
        route: ProxyRoute,
        mode: Mode,
        max_message_size: usize,
        store: Store,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let session = store
            .get_or_create_session(
                &route.session_name,
                &format!("Proxy session for {route_name}"),
            )
            .await?;

        Ok(Self {
            route_name: route_name.to_owned(),
            route,
            mode,
            store,
            session,
            observer,
            max_message_size,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn use_tls(&self) -> bool {
        self.route.target_port == 443 || matches!(self.route.protocol, RouteProtocol::Https)
    }

    async fn connect(&self) -> std::result::Result<Channel, Status> {
        let tls = self.use_tls();
        let scheme = if tls { "https" } else { "http" };
        let target = format!(
            "{scheme}://{}:{}",
            self.route.target_host, self.route.target_port
        );

        let endpoint = Channel::from_shared(target.clone())
            .map_err(|e| Status::internal(format!("invalid backend address {target}: {e}")))?;
        let endpoint = if tls {
            endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| Status::internal(format!("tls setup for {target} failed: {e}")))?
        } else {
            endpoint
        };

        endpoint.connect().await.map_err(|e| {
            Status::unavailable(format!("failed to connect to backend {target}: {e}"))
        })
    }

    fn client(&self, channel: Channel) -> tonic::client::Grpc<Channel> {
        tonic::client::Grpc::new(channel)
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size)
    }

    /// Forward one unary call, recording the exchange in record mode.
    pub async fn handle_unary(
        &self,
        full_method: &str,
        request: tonic::Request<RawMessage>,
    ) -> std::result::Result<tonic::Response<RawMessage>, Status> {
        let metadata = request.metadata().clone();
        let request_bytes = request.into_inner().data;
        let metadata_json = metadata_to_json(&metadata);
        let request_id = generate_request_id();
        let recording = self.mode == Mode::Record;

        if recording {
            debug!(route = %self.route_name, "-> {} ({} bytes, unary)", full_method, request_bytes.len());
            self.observer
                .broadcast_request(RequestEvent {
                    method: full_method.to_owned(),
                    endpoint: full_method.to_owned(),
                    session_name: self.session.name.clone(),
                    remote_addr: GRPC_CLIENT_ADDR.to_owned(),
                    request_id: request_id.clone(),
                    headers: crate::events::headers_from_json("{}"),
                    body: format!("gRPC raw message ({} bytes)", request_bytes.len()),
                })
                .await;
        }

        let channel = self.connect().await?;
        let mut grpc = self.client(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;

        let path = PathAndQuery::try_from(full_method.to_owned())
            .map_err(|e| Status::internal(format!("invalid method path {full_method}: {e}")))?;

        let mut outbound = tonic::Request::new(RawMessage::new(request_bytes.clone()));
        *outbound.metadata_mut() = metadata;

        let result: std::result::Result<tonic::Response<RawMessage>, Status> =
            grpc.unary(outbound, path, RawCodec).await;

        if recording {
            let (status_code, response_bytes) = match &result {
                Ok(response) => (Code::Ok as i32, response.get_ref().data.clone()),
                Err(status) => (status.code() as i32, Bytes::new()),
            };
            debug!(route = %self.route_name, "<- {} ({} bytes, unary)", full_method, response_bytes.len());

            let mut interaction = Interaction::new(Protocol::Grpc, full_method, full_method);
            interaction.session_id = self.session.id;
            interaction.request_id = request_id.clone();
            interaction.request_headers = metadata_json;
            interaction.request_body = request_bytes.to_vec();
            interaction.response_status = status_code;
            interaction.response_headers = "{}".to_owned();
            interaction.response_body = response_bytes.to_vec();

            match self.store.record_interaction(interaction).await {
                Ok(_) => {
                    info!(route = %self.route_name, "recorded gRPC interaction: {} -> {}", full_method, status_code)
                }
                Err(e) => {
                    error!(route = %self.route_name, "error recording gRPC interaction: {e}")
                }
            }

            self.observer
                .broadcast_response(ResponseEvent {
                    method: full_method.to_owned(),
                    endpoint: full_method.to_owned(),
                    session_name: self.session.name.clone(),
                    remote_addr: GRPC_CLIENT_ADDR.to_owned(),
                    request_id,
                    status: status_code,
                    headers: crate::events::headers_from_json("{}"),
                    body: format!("gRPC raw message ({} bytes)", response_bytes.len()),
                })
                .await;
        }

        result
    }

    /// Proxy a streaming call both ways until either side finishes.
    /// Streaming exchanges are not persisted as chunks.
    pub async fn handle_streaming(
        &self,
        full_method: &str,
        request: tonic::Request<Streaming<RawMessage>>,
    ) -> std::result::Result<tonic::Response<Streaming<RawMessage>>, Status> {
        info!(route = %self.route_name, "proxying streaming call: {full_method}");

        let metadata = request.metadata().clone();
        let route_name = self.route_name.clone();
        let method = full_method.to_owned();
        let inbound = request.into_inner().filter_map(move |frame| {
            let route_name = route_name.clone();
            let method = method.clone();
            async move {
                match frame {
                    Ok(message) => {
                        debug!(route = %route_name, "-> {} ({} bytes)", method, message.data.len());
                        Some(message)
                    }
                    Err(e) => {
                        error!(route = %route_name, "client stream error on {}: {e}", method);
                        None
                    }
                }
            }
        });

        let channel = self.connect().await?;
        let mut grpc = self.client(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;

        let path = PathAndQuery::try_from(full_method.to_owned())
            .map_err(|e| Status::internal(format!("invalid method path {full_method}: {e}")))?;

        let mut outbound = tonic::Request::new(inbound);
        *outbound.metadata_mut() = metadata;

        grpc.streaming(outbound, path, RawCodec).await
    }
}
