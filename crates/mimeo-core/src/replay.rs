//! Replay engine: re-issue recorded traffic against a live target
//!
//! Interactions are replayed in recorded timestamp order, either
//! sequentially (reproducing the original inter-call pacing) or gated
//! by a semaphore when concurrency is requested. Every call produces a
//! result record validated against the recording; the aggregate report
//! drives the CLI exit code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use http::uri::PathAndQuery;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::{info, warn};

use crate::config::{ReplayConfig, RouteProtocol, ValidationStrategy};
use crate::error::{AppError, Result};
use crate::grpc::raw::{RawCodec, RawMessage};
use crate::grpc::metadata_from_json;
use crate::model::{Interaction, Protocol, Session};
use crate::storage::Store;

/// Outcome of replaying a single interaction.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub interaction: Interaction,
    pub success: bool,
    pub expected_status: i32,
    pub actual_status: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expected_body: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actual_body: Vec<u8>,
    /// Wall-clock time of the replayed call, in milliseconds.
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl ReplayResult {
    fn new(interaction: &Interaction) -> Self {
        Self {
            interaction: interaction.clone(),
            success: false,
            expected_status: interaction.response_status,
            actual_status: 0,
            expected_body: interaction.response_body.clone(),
            actual_body: Vec::new(),
            response_time_ms: 0,
            error: None,
            validation_error: None,
        }
    }
}

/// Aggregate results for one replayed session.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub session_name: String,
    pub total_requests: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<ReplayResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct ReplayEngine {
    config: ReplayConfig,
    store: Store,
    session: Session,
    client: reqwest::Client,
    /// One connection reused for every gRPC call of the session.
    grpc_channel: Option<Channel>,
}

impl ReplayEngine {
    pub async fn new(config: ReplayConfig, store: Store) -> Result<Self> {
        let session = store.get_session(&config.session_name).await?;

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_seconds));
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let has_grpc = config.protocol == RouteProtocol::Grpc || {
            store
                .get_interactions_by_session(session.id)
                .await?
                .iter()
                .any(|i| i.protocol == Protocol::Grpc)
        };

        let grpc_channel = if has_grpc {
            Some(Self::grpc_channel(&config)?)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            session,
            client,
            grpc_channel,
        })
    }

    fn grpc_channel(config: &ReplayConfig) -> Result<Channel> {
        let scheme = if config.grpc_insecure { "http" } else { "https" };
        let target = format!("{scheme}://{}:{}", config.target_host, config.target_port);
        let endpoint = Channel::from_shared(target.clone())
            .map_err(|e| AppError::ConfigError(format!("invalid replay target {target}: {e}")))?;
        let endpoint = if config.grpc_insecure {
            endpoint
        } else {
            endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| AppError::ConfigError(format!("tls setup failed: {e}")))?
        };
        Ok(endpoint.connect_lazy())
    }

    /// Replay the whole session and aggregate a report.
    pub async fn replay(&self) -> Result<ReplayReport> {
        info!(
            "replaying session '{}' against {}:{}",
            self.config.session_name, self.config.target_host, self.config.target_port
        );

        let mut interactions = self.store.get_interactions_by_session(self.session.id).await?;
        if interactions.is_empty() {
            return Err(AppError::InvalidRequest(format!(
                "no interactions found in session '{}'",
                self.config.session_name
            )));
        }
        interactions.sort_by_key(|i| i.timestamp);

        let start_time = Utc::now();
        let started = Instant::now();

        let results = if self.config.max_concurrency > 0 {
            self.replay_concurrent(interactions.clone()).await
        } else {
            self.replay_sequential(&interactions).await
        };

        let end_time = Utc::now();
        let success_count = results.iter().filter(|r| r.success).count();
        let total_requests = interactions.len();
        let report = ReplayReport {
            session_name: self.config.session_name.clone(),
            total_requests,
            success_count,
            failure_count: total_requests - success_count,
            results,
            start_time,
            end_time,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "replay completed: {}/{} successful, {} failed",
            report.success_count, report.total_requests, report.failure_count
        );
        Ok(report)
    }

    /// One call at a time; recorded inter-call gaps are reproduced
    /// unless `ignore_timestamps` is set.
    async fn replay_sequential(&self, interactions: &[Interaction]) -> Vec<ReplayResult> {
        let mut results = Vec::with_capacity(interactions.len());
        let mut previous_timestamp: Option<DateTime<Utc>> = None;

        for interaction in interactions {
            if !self.config.ignore_timestamps {
                if let Some(previous) = previous_timestamp {
                    let gap = interaction.timestamp - previous;
                    if let Ok(delay) = gap.to_std() {
                        if !delay.is_zero() {
                            info!("waiting {delay:?} before next request (original timing)");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            previous_timestamp = Some(interaction.timestamp);

            let result = self.replay_interaction(interaction).await;
            let failed = !result.success;
            results.push(result);

            if failed && self.config.fail_fast {
                warn!("fail-fast: aborting replay after first failure");
                break;
            }
        }

        results
    }

    /// Semaphore-gated fan-out. With `fail_fast`, work not yet started
    /// is skipped after the first failure; in-flight calls complete.
    async fn replay_concurrent(&self, interactions: Vec<Interaction>) -> Vec<ReplayResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let stop = Arc::new(AtomicBool::new(false));
        let results = Arc::new(Mutex::new(Vec::with_capacity(interactions.len())));

        let mut handles = Vec::with_capacity(interactions.len());
        for interaction in interactions {
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            let results = results.clone();
            let engine = self;

            // Scoped borrow: futures complete before replay_concurrent
            // returns, so borrowing `self` across tasks is done through
            // join below rather than detached tasks.
            handles.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if engine.config.fail_fast && stop.load(Ordering::SeqCst) {
                    return;
                }
                let result = engine.replay_interaction(&interaction).await;
                if !result.success {
                    stop.store(true, Ordering::SeqCst);
                }
                results.lock().await.push(result);
            });
        }

        futures::future::join_all(handles).await;

        match Arc::try_unwrap(results) {
            Ok(mutex) => mutex.into_inner(),
            Err(arc) => arc.lock().await.clone(),
        }
    }

    async fn replay_interaction(&self, interaction: &Interaction) -> ReplayResult {
        match interaction.protocol {
            Protocol::Grpc => self.replay_grpc(interaction).await,
            Protocol::Rest => self.replay_http(interaction).await,
        }
    }

    async fn replay_http(&self, interaction: &Interaction) -> ReplayResult {
        let mut result = ReplayResult::new(interaction);
        let url = format!(
            "{}://{}:{}{}",
            self.config.protocol.scheme(),
            self.config.target_host,
            self.config.target_port,
            interaction.endpoint
        );

        let method = match reqwest::Method::from_bytes(interaction.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                result.error = Some(format!("invalid method '{}': {e}", interaction.method));
                return result;
            }
        };

        let mut request = self
            .client
            .request(method, &url)
            .body(interaction.request_body.clone());
        if let Ok(headers) =
            serde_json::from_str::<std::collections::HashMap<String, String>>(
                &interaction.request_headers,
            )
        {
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                result.error = Some(format!("request failed: {e}"));
                result.response_time_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        result.response_time_ms = started.elapsed().as_millis() as u64;
        result.actual_status = response.status().as_u16() as i32;

        match response.bytes().await {
            Ok(body) => result.actual_body = body.to_vec(),
            Err(e) => {
                result.error = Some(format!("failed to read response body: {e}"));
                return result;
            }
        }

        let (success, validation_error) = self.validate(&result);
        result.success = success;
        result.validation_error = validation_error;
        result
    }

    async fn replay_grpc(&self, interaction: &Interaction) -> ReplayResult {
        let mut result = ReplayResult::new(interaction);
        let Some(channel) = &self.grpc_channel else {
            result.error = Some("gRPC connection not available".to_owned());
            return result;
        };

        let path = match PathAndQuery::try_from(interaction.endpoint.clone()) {
            Ok(path) => path,
            Err(e) => {
                result.error = Some(format!("invalid method path: {e}"));
                return result;
            }
        };

        let limit = self.config.grpc_max_message_size;
        let mut grpc = tonic::client::Grpc::new(channel.clone())
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);

        let mut request =
            tonic::Request::new(RawMessage::new(interaction.request_body.clone()));
        *request.metadata_mut() = metadata_from_json(&interaction.request_headers);
        request.set_timeout(Duration::from_secs(self.config.timeout_seconds));

        let started = Instant::now();
        if let Err(e) = grpc.ready().await {
            result.error = Some(format!("gRPC channel not ready: {e}"));
            result.response_time_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let response: std::result::Result<tonic::Response<RawMessage>, tonic::Status> =
            grpc.unary(request, path, RawCodec).await;
        result.response_time_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                result.actual_status = tonic::Code::Ok as i32;
                result.actual_body = response.into_inner().data.to_vec();
                let (success, validation_error) = self.validate(&result);
                result.success = success;
                result.validation_error = validation_error;
            }
            Err(status) => {
                result.actual_status = status.code() as i32;
                // A recorded non-OK status is an expected outcome, not a
                // transport failure.
                if result.expected_status != 0 && result.actual_status == result.expected_status {
                    let (success, validation_error) = self.validate(&result);
                    result.success = success;
                    result.validation_error = validation_error;
                } else {
                    result.error = Some(format!("gRPC call failed: {status}"));
                }
            }
        }
        result
    }

    fn validate(&self, result: &ReplayResult) -> (bool, Option<String>) {
        validate_response(result, self.config.matching_strategy)
    }
}

/// Validate an actual response against its recording.
pub fn validate_response(
    result: &ReplayResult,
    strategy: ValidationStrategy,
) -> (bool, Option<String>) {
    if result.actual_status != result.expected_status {
        return (
            false,
            Some(format!(
                "status mismatch: expected {}, got {}",
                result.expected_status, result.actual_status
            )),
        );
    }

    match strategy {
        ValidationStrategy::StatusCode => (true, None),
        ValidationStrategy::Exact => {
            if result.actual_body != result.expected_body {
                (
                    false,
                    Some(format!(
                        "body mismatch: expected {} bytes, got {} bytes",
                        result.expected_body.len(),
                        result.actual_body.len()
                    )),
                )
            } else {
                (true, None)
            }
        }
        ValidationStrategy::Fuzzy => {
            let expected = serde_json::from_slice::<serde_json::Value>(&result.expected_body);
            let actual = serde_json::from_slice::<serde_json::Value>(&result.actual_body);
            if let (Ok(expected), Ok(actual)) = (expected, actual) {
                if json_kind(&expected) != json_kind(&actual) {
                    return (
                        false,
                        Some(format!(
                            "JSON structure mismatch: expected {}, got {}",
                            json_kind(&expected),
                            json_kind(&actual)
                        )),
                    );
                }
            }
            (true, None)
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
