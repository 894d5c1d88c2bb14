//! Proxy configuration
//!
//! Deserialized from a YAML file by the CLI; every field has a default
//! so a missing config file still yields a runnable setup. `validate()`
//! is the single gate for programmer errors (bad modes, broken regexes,
//! missing targets) and is called once at startup.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Global operation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Record,
    Mock,
    Replay,
}

/// Upstream protocol of a proxy route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteProtocol {
    #[default]
    Http,
    Https,
    Grpc,
}

impl RouteProtocol {
    pub fn is_grpc(&self) -> bool {
        matches!(self, RouteProtocol::Grpc)
    }

    /// URL scheme used when building upstream HTTP URLs.
    pub fn scheme(&self) -> &'static str {
        match self {
            RouteProtocol::Http => "http",
            RouteProtocol::Https | RouteProtocol::Grpc => "https",
        }
    }
}

/// Request-content matching strategy for mock mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchingStrategy {
    #[default]
    Exact,
    Pattern,
    Fuzzy,
    FuzzyUnordered,
}

impl MatchingStrategy {
    pub fn is_fuzzy(&self) -> bool {
        matches!(self, MatchingStrategy::Fuzzy | MatchingStrategy::FuzzyUnordered)
    }
}

/// Candidate selection mode for mock mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    #[default]
    Ordered,
    Random,
}

/// Response validation strategy for replay mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStrategy {
    #[default]
    Exact,
    Fuzzy,
    StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub proxies: BTreeMap<String, ProxyRoute>,
    pub database: DatabaseConfig,
    pub recording: RecordingConfig,
    pub mock: MockConfig,
    pub replay: ReplayConfig,
    pub grpc: GrpcConfig,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut proxies = BTreeMap::new();
        proxies.insert("default".to_owned(), ProxyRoute::default());
        Self {
            mode: Mode::Record,
            server: ServerConfig::default(),
            proxies,
            database: DatabaseConfig::default(),
            recording: RecordingConfig::default(),
            mock: MockConfig::default(),
            replay: ReplayConfig::default(),
            grpc: GrpcConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// 0 means "derive from listen_port + 1000" during validation.
    pub grpc_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_owned(),
            listen_port: 8080,
            grpc_port: 9080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRoute {
    pub target_host: String,
    pub target_port: u16,
    pub protocol: RouteProtocol,
    pub session_name: String,
    /// Regex matched against the gRPC service name (`package.Service`).
    pub service_pattern: String,
    /// Regex matched against the gRPC method simple name.
    pub method_pattern: String,
    /// Fallback route when no pattern matches.
    pub is_default: bool,
    /// Capture SSE streams chunk-by-chunk on this route.
    pub enable_streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub connection_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.mimeo/recordings.db".to_owned(),
            connection_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub capture_headers: bool,
    pub capture_body: bool,
    /// Regexes applied to serialized headers; matches become `[REDACTED]`.
    pub redact_patterns: Vec<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            capture_headers: true,
            capture_body: true,
            redact_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub matching_strategy: MatchingStrategy,
    pub sequence_mode: SequenceMode,
    /// Replay SSE chunks with their recorded inter-arrival delays.
    pub respect_streaming_timing: bool,
    /// Header/JSON keys ignored under the fuzzy strategies.
    pub fuzzy_ignore_fields: Vec<String>,
    pub not_found_response: NotFoundResponse,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            matching_strategy: MatchingStrategy::Exact,
            sequence_mode: SequenceMode::Ordered,
            respect_streaming_timing: false,
            fuzzy_ignore_fields: Vec::new(),
            not_found_response: NotFoundResponse::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotFoundResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Default for NotFoundResponse {
    fn default() -> Self {
        Self {
            status: 404,
            body: serde_json::json!({"error": "Recording not found"}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub target_host: String,
    pub target_port: u16,
    pub protocol: RouteProtocol,
    pub session_name: String,
    pub matching_strategy: ValidationStrategy,
    pub fail_fast: bool,
    pub timeout_seconds: u64,
    /// 0 = sequential with recorded pacing.
    pub max_concurrency: usize,
    pub ignore_timestamps: bool,
    pub insecure_skip_verify: bool,
    pub grpc_max_message_size: usize,
    pub grpc_insecure: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            target_host: String::new(),
            target_port: 0,
            protocol: RouteProtocol::Https,
            session_name: String::new(),
            matching_strategy: ValidationStrategy::Exact,
            fail_fast: false,
            timeout_seconds: 30,
            max_concurrency: 0,
            ignore_timestamps: false,
            insecure_skip_verify: false,
            grpc_max_message_size: 256 * 1024 * 1024,
            grpc_insecure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub max_message_size: usize,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub pretty_print: bool,
    pub compress: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            pretty_print: true,
            compress: false,
        }
    }
}

impl Config {
    /// Validate the configuration, filling derived defaults (the gRPC
    /// port) in place. Invalid regexes and missing required fields are
    /// fatal: the caller is expected to exit.
    pub fn validate(&mut self) -> Result<()> {
        if self.server.listen_port == 0 {
            return Err(AppError::ConfigError(
                "server.listen_port must be set".into(),
            ));
        }
        if self.server.grpc_port == 0 {
            self.server.grpc_port = self.server.listen_port.saturating_add(1000);
        }

        if self.proxies.is_empty() {
            return Err(AppError::ConfigError(
                "at least one proxy must be configured".into(),
            ));
        }

        for (name, route) in &self.proxies {
            if route.session_name.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "session_name is required for proxy '{name}'"
                )));
            }
            if self.mode == Mode::Record && (route.target_host.is_empty() || route.target_port == 0)
            {
                return Err(AppError::ConfigError(format!(
                    "target_host and target_port are required in record mode for proxy '{name}'"
                )));
            }
            compile_optional_pattern(&route.service_pattern)
                .map_err(|e| AppError::ConfigError(format!(
                    "invalid service_pattern for proxy '{name}': {e}"
                )))?;
            compile_optional_pattern(&route.method_pattern)
                .map_err(|e| AppError::ConfigError(format!(
                    "invalid method_pattern for proxy '{name}': {e}"
                )))?;
        }

        for pattern in &self.recording.redact_patterns {
            Regex::new(pattern).map_err(|e| {
                AppError::ConfigError(format!("invalid redact pattern '{pattern}': {e}"))
            })?;
        }

        if self.mode == Mode::Replay {
            if self.replay.target_host.is_empty() {
                return Err(AppError::ConfigError(
                    "target_host is required in replay mode".into(),
                ));
            }
            if self.replay.target_port == 0 {
                return Err(AppError::ConfigError(
                    "target_port is required in replay mode".into(),
                ));
            }
            if self.replay.session_name.is_empty() {
                return Err(AppError::ConfigError(
                    "session_name is required in replay mode".into(),
                ));
            }
            if self.replay.grpc_max_message_size == 0 {
                self.replay.grpc_max_message_size = 256 * 1024 * 1024;
            }
        }

        if self.database.path.is_empty() {
            return Err(AppError::ConfigError("database path cannot be empty".into()));
        }

        Ok(())
    }
}

/// Compile a possibly-empty pattern field; empty means "not set".
pub fn compile_optional_pattern(pattern: &str) -> std::result::Result<Option<Regex>, regex::Error> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.grpc_port, 9080);
    }

    #[test]
    fn grpc_port_defaults_to_http_plus_1000() {
        let mut config = Config::default();
        config.server.listen_port = 4000;
        config.server.grpc_port = 0;
        config.validate().unwrap();
        assert_eq!(config.server.grpc_port, 5000);
    }

    #[test]
    fn record_mode_requires_targets() {
        let mut config = Config::default();
        config.mode = Mode::Record;
        // Default route has no target host/port.
        assert!(config.validate().is_err());

        let route = config.proxies.get_mut("default").unwrap();
        route.target_host = "api.example.com".into();
        route.target_port = 443;
        config.validate().unwrap();
    }

    #[test]
    fn bad_redact_pattern_is_fatal() {
        let mut config = Config::default();
        config.mode = Mode::Mock;
        config.recording.redact_patterns = vec!["(unclosed".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn replay_mode_requires_target_and_session() {
        let mut config = Config::default();
        config.mode = Mode::Replay;
        assert!(config.validate().is_err());

        config.replay.target_host = "localhost".into();
        config.replay.target_port = 9000;
        config.replay.session_name = "smoke".into();
        config.validate().unwrap();
    }

    #[test]
    fn strategies_deserialize_from_kebab_and_snake_case() {
        let yaml = r#"
mode: mock
mock:
  matching_strategy: fuzzy-unordered
replay:
  matching_strategy: status_code
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mock.matching_strategy, MatchingStrategy::FuzzyUnordered);
        assert_eq!(config.replay.matching_strategy, ValidationStrategy::StatusCode);
    }
}
