//! Mock handler for gRPC calls
//!
//! Looks up recordings by `(session, full_method, full_method)` and
//! answers with the first match's metadata and response bytes. Unlike
//! the HTTP mock engine there is no sequence cursor here; candidate
//! selection is first-match.

use std::sync::Arc;

use tonic::Status;
use tracing::{error, info};

use crate::config::ProxyRoute;
use crate::error::Result;
use crate::events::{Observer, RequestEvent, ResponseEvent};
use crate::grpc::metadata_from_json;
use crate::grpc::raw::{generate_request_id, RawMessage};
use crate::model::Session;
use crate::storage::Store;

const GRPC_MOCK_CLIENT_ADDR: &str = "grpc-mock-client";

pub struct GrpcMock {
    route_name: String,
    store: Store,
    session: Session,
    observer: Arc<dyn Observer>,
}

impl GrpcMock {
    pub async fn new(
        route_name: &str,
        route: &ProxyRoute,
        store: Store,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let session = store
            .get_or_create_session(&route.session_name, "Mock session")
            .await?;

        Ok(Self {
            route_name: route_name.to_owned(),
            store,
            session,
            observer,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Answer one unary call from the recordings.
    pub async fn handle_unary(
        &self,
        full_method: &str,
        request: tonic::Request<RawMessage>,
    ) -> std::result::Result<tonic::Response<RawMessage>, Status> {
        info!(route = %self.route_name, "[GRPC MOCK] {full_method}");

        let request_bytes = request.into_inner().data;
        let request_id = generate_request_id();

        self.observer
            .broadcast_request(RequestEvent {
                method: full_method.to_owned(),
                endpoint: full_method.to_owned(),
                session_name: self.session.name.clone(),
                remote_addr: GRPC_MOCK_CLIENT_ADDR.to_owned(),
                request_id: request_id.clone(),
                headers: Default::default(),
                body: format!("gRPC mock request ({} bytes)", request_bytes.len()),
            })
            .await;

        let interactions = self
            .store
            .find_matching_interactions(self.session.id, full_method, full_method)
            .await
            .map_err(|e| {
                error!(route = %self.route_name, "error finding gRPC interactions: {e}");
                Status::internal("failed to find matching interactions")
            })?;

        let Some(selected) = interactions.first() else {
            info!(route = %self.route_name, "no recorded gRPC interaction for {full_method}");
            return Err(Status::not_found(format!(
                "no recorded interaction found for method {full_method}"
            )));
        };

        info!(
            route = %self.route_name,
            "served gRPC mock response: {} -> {} ({} bytes)",
            full_method,
            selected.response_status,
            selected.response_body.len()
        );

        self.observer
            .broadcast_response(ResponseEvent {
                method: full_method.to_owned(),
                endpoint: full_method.to_owned(),
                session_name: self.session.name.clone(),
                remote_addr: GRPC_MOCK_CLIENT_ADDR.to_owned(),
                request_id,
                status: selected.response_status,
                headers: Default::default(),
                body: format!("gRPC mock response ({} bytes)", selected.response_body.len()),
            })
            .await;

        let mut response =
            tonic::Response::new(RawMessage::new(selected.response_body.clone()));
        *response.metadata_mut() = metadata_from_json(&selected.response_headers);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpObserver;
    use crate::model::{Interaction, Protocol};
    use tempfile::TempDir;

    async fn mock_with_recording() -> (TempDir, GrpcMock) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("recordings.db")).unwrap();
        let route = ProxyRoute {
            session_name: "grpc-mock".to_owned(),
            ..ProxyRoute::default()
        };
        let mock = GrpcMock::new("grpc", &route, store.clone(), Arc::new(NoOpObserver))
            .await
            .unwrap();

        let full_method = "/com.example.user.UserService/GetUser";
        let mut interaction = Interaction::new(Protocol::Grpc, full_method, full_method);
        interaction.session_id = mock.session().id;
        interaction.request_id = "grpc-test-1".to_owned();
        interaction.request_headers = "{}".to_owned();
        interaction.request_body = vec![1, 2, 3];
        interaction.response_status = 0;
        interaction.response_headers = r#"{"x-backend":["users-1"]}"#.to_owned();
        interaction.response_body = vec![9, 8, 7];
        store.record_interaction(interaction).await.unwrap();

        (dir, mock)
    }

    #[tokio::test]
    async fn recorded_call_is_served_with_metadata() {
        let (_dir, mock) = mock_with_recording().await;
        let response = mock
            .handle_unary(
                "/com.example.user.UserService/GetUser",
                tonic::Request::new(RawMessage::new(vec![1, 2, 3])),
            )
            .await
            .unwrap();

        assert_eq!(&response.get_ref().data[..], &[9, 8, 7]);
        assert_eq!(response.metadata().get("x-backend").unwrap(), "users-1");
    }

    #[tokio::test]
    async fn unknown_method_yields_not_found() {
        let (_dir, mock) = mock_with_recording().await;
        let err = mock
            .handle_unary(
                "/com.example.user.UserService/DeleteUser",
                tonic::Request::new(RawMessage::default()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
