//! Mimeo CLI
//!
//! Command-line interface for the mimeo record/replay proxy. The
//! default invocation starts the configured proxies; subcommands cover
//! replay validation, session export/import and store maintenance.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimeo_core::export::{Exporter, MergeStrategy};
use mimeo_core::replay::ReplayEngine;
use mimeo_core::{Config, Mode, RouteProtocol, Store};
use tracing_subscriber::EnvFilter;

mod server;
mod web;

/// Mimeo - transparent record/replay proxy for REST and gRPC APIs
///
/// Record real traffic, serve it back as mocks, or replay it against a
/// live target to validate API compatibility.
#[derive(Parser, Debug)]
#[command(name = "mimeo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start only the web UI/API without any proxy routes
    Web,

    /// Replay a recorded session against a live target
    Replay {
        /// Session to replay (overrides replay.session_name)
        #[arg(short, long)]
        session: Option<String>,
        /// Target host (overrides replay.target_host)
        #[arg(long)]
        target_host: Option<String>,
        /// Target port (overrides replay.target_port)
        #[arg(long)]
        target_port: Option<u16>,
        /// Target protocol: http, https or grpc
        #[arg(long)]
        protocol: Option<String>,
        /// Write the full JSON report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export a session to a JSON file
    Export {
        /// Session to export
        session: String,
        /// Output file (use a .gz suffix for compression)
        output: PathBuf,
    },

    /// Import a previously exported session
    Import {
        /// Input file
        input: PathBuf,
        /// Target session name (defaults to the name in the file)
        #[arg(short, long)]
        session: Option<String>,
        /// Merge strategy: append or replace
        #[arg(short, long, default_value = "append")]
        merge: String,
    },

    /// List recorded sessions
    ListSessions,

    /// Delete one session, or everything
    Clear {
        /// Session to clear; omit to clear all sessions
        #[arg(short, long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    config
        .validate()
        .context("invalid configuration")?;

    let store = Store::open(&config.database.path).context("open recordings database")?;

    match cli.command {
        None => {
            if config.mode == Mode::Replay {
                return replay(&config, store, None, None, None, None, None).await;
            }
            server::MultiProxyServer::new(config, store).run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Web) => {
            config.proxies.clear();
            server::MultiProxyServer::new(config, store).run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Replay {
            session,
            target_host,
            target_port,
            protocol,
            output,
        }) => replay(&config, store, session, target_host, target_port, protocol, output).await,
        Some(Command::Export { session, output }) => {
            let exporter = Exporter::new(store, config.export.clone());
            exporter.export_session(&session, &output).await?;
            println!("Exported session '{session}' to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Import {
            input,
            session,
            merge,
        }) => {
            let exporter = Exporter::new(store, config.export.clone());
            exporter
                .import_session(&input, session.as_deref(), MergeStrategy::parse(&merge))
                .await?;
            println!("Imported {}", input.display());
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::ListSessions) => {
            let sessions = store.list_sessions().await?;
            if sessions.is_empty() {
                println!("No recorded sessions.");
            }
            for session in sessions {
                println!(
                    "{}\t{}\t{}",
                    session.name,
                    session.created_at.to_rfc3339(),
                    session.description
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Clear { session }) => {
            match session {
                Some(name) => {
                    store.clear_session(&name).await?;
                    println!("Cleared session '{name}'");
                }
                None => {
                    store.clear_all().await?;
                    println!("Cleared all sessions");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn replay(
    config: &Config,
    store: Store,
    session: Option<String>,
    target_host: Option<String>,
    target_port: Option<u16>,
    protocol: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let mut replay_config = config.replay.clone();
    if let Some(session) = session {
        replay_config.session_name = session;
    }
    if let Some(host) = target_host {
        replay_config.target_host = host;
    }
    if let Some(port) = target_port {
        replay_config.target_port = port;
    }
    if let Some(protocol) = protocol {
        replay_config.protocol = parse_protocol(&protocol)?;
    }

    if replay_config.session_name.is_empty() {
        anyhow::bail!("no replay session configured; pass --session or set replay.session_name");
    }
    if replay_config.target_host.is_empty() || replay_config.target_port == 0 {
        anyhow::bail!("no replay target configured; pass --target-host/--target-port");
    }

    let engine = ReplayEngine::new(replay_config, store).await?;
    let report = engine.replay().await?;

    for result in &report.results {
        let marker = if result.success { "ok  " } else { "FAIL" };
        let detail = result
            .validation_error
            .as_deref()
            .or(result.error.as_deref())
            .unwrap_or("");
        println!(
            "{marker} {} {} ({} -> {}) {}ms {detail}",
            result.interaction.method,
            result.interaction.endpoint,
            result.expected_status,
            result.actual_status,
            result.response_time_ms,
        );
    }
    println!(
        "{}/{} successful, {} failed in {}ms",
        report.success_count, report.total_requests, report.failure_count, report.duration_ms
    );

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if report.failure_count > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn parse_protocol(raw: &str) -> anyhow::Result<RouteProtocol> {
    match raw {
        "http" => Ok(RouteProtocol::Http),
        "https" => Ok(RouteProtocol::Https),
        "grpc" => Ok(RouteProtocol::Grpc),
        other => anyhow::bail!("invalid protocol '{other}' (must be http, https or grpc)"),
    }
}

/// Resolve the configuration: an explicit path must exist, otherwise
/// the working directory and `~/.mimeo` are searched, and a missing
/// file falls back to defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        return serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()));
    }

    let mut candidates = vec![PathBuf::from("config.yaml"), PathBuf::from("config.yml")];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(Path::new(&home).join(".mimeo").join("config.yaml"));
    }

    for candidate in candidates {
        if candidate.exists() {
            let raw = std::fs::read_to_string(&candidate)
                .with_context(|| format!("read config file {}", candidate.display()))?;
            return serde_yaml::from_str(&raw)
                .with_context(|| format!("parse config file {}", candidate.display()));
        }
    }

    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn config_file_round_trips_through_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
mode: mock
server:
  listen_port: 9999
proxies:
  api:
    target_host: api.example.com
    target_port: 443
    protocol: https
    session_name: smoke
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.listen_port, 9999);
        assert_eq!(config.proxies["api"].session_name, "smoke");
        assert_eq!(config.proxies["api"].protocol, RouteProtocol::Https);
    }

    #[test]
    fn protocol_parsing_rejects_unknown_values() {
        assert!(parse_protocol("http").is_ok());
        assert!(parse_protocol("grpc").is_ok());
        assert!(parse_protocol("ftp").is_err());
    }
}
