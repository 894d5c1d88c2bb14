//! JSON export/import of recorded sessions
//!
//! The on-disk document embeds JSON-valued bodies as JSON and
//! everything else as strings, so exports stay reviewable in a text
//! editor. Paths ending in `.gz` are transparently compressed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExportConfig;
use crate::error::{AppError, Result};
use crate::model::{Interaction, Protocol};
use crate::storage::Store;

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// How imported interactions combine with an existing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Insert in addition to whatever the session already holds.
    #[default]
    Append,
    /// Clear the target session first.
    Replace,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "replace" => MergeStrategy::Replace,
            _ => MergeStrategy::Append,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub version: String,
    pub session: ExportSession,
    pub interactions: Vec<ExportInteraction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSession {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInteraction {
    pub request_id: String,
    pub protocol: Protocol,
    pub method: String,
    pub endpoint: String,
    pub request: ExportRequest,
    pub response: ExportResponse,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub status: i32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

pub struct Exporter {
    store: Store,
    config: ExportConfig,
}

impl Exporter {
    pub fn new(store: Store, config: ExportConfig) -> Self {
        Self { store, config }
    }

    /// Export a named session to `output_path`.
    pub async fn export_session(&self, session_name: &str, output_path: &Path) -> Result<()> {
        let session = self.store.get_session(session_name).await?;
        let interactions = self.store.get_interactions_by_session(session.id).await?;

        let export_interactions = interactions
            .into_iter()
            .map(to_export_interaction)
            .collect::<Result<Vec<_>>>()?;

        let data = ExportData {
            version: EXPORT_FORMAT_VERSION.to_owned(),
            session: ExportSession {
                name: session.name,
                created_at: session.created_at,
                description: session.description,
            },
            interactions: export_interactions,
        };

        self.write_export(&data, output_path)
    }

    /// Import a previously exported file. `session_name` overrides the
    /// session recorded in the file when non-empty.
    pub async fn import_session(
        &self,
        input_path: &Path,
        session_name: Option<&str>,
        merge: MergeStrategy,
    ) -> Result<()> {
        let data = self.read_export(input_path)?;
        validate_export(&data)?;

        let target = match session_name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => data.session.name.clone(),
        };

        if merge == MergeStrategy::Replace {
            match self.store.clear_session(&target).await {
                Ok(()) => {}
                // Replacing a session that does not exist yet is fine.
                Err(AppError::SessionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let interactions = data
            .interactions
            .into_iter()
            .map(from_export_interaction)
            .collect::<Result<Vec<_>>>()?;

        self.store.import_interactions(&target, interactions).await
    }

    fn write_export(&self, data: &ExportData, output_path: &Path) -> Result<()> {
        let json = if self.config.pretty_print {
            serde_json::to_vec_pretty(data)?
        } else {
            serde_json::to_vec(data)?
        };

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::File::create(output_path)
            .map_err(|e| AppError::ExportError(format!("create output file: {e}")))?;

        if self.config.compress && has_gz_extension(output_path) {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder
                .write_all(&json)
                .and_then(|_| encoder.finish().map(|_| ()))
                .map_err(|e| AppError::ExportError(format!("write compressed export: {e}")))?;
        } else {
            let mut file = file;
            file.write_all(&json)
                .map_err(|e| AppError::ExportError(format!("write export: {e}")))?;
        }
        Ok(())
    }

    fn read_export(&self, input_path: &Path) -> Result<ExportData> {
        let file = std::fs::File::open(input_path)
            .map_err(|e| AppError::ExportError(format!("open input file: {e}")))?;

        let mut raw = Vec::new();
        if has_gz_extension(input_path) {
            GzDecoder::new(file)
                .read_to_end(&mut raw)
                .map_err(|e| AppError::ExportError(format!("read compressed export: {e}")))?;
        } else {
            let mut file = file;
            file.read_to_end(&mut raw)
                .map_err(|e| AppError::ExportError(format!("read export: {e}")))?;
        }

        serde_json::from_slice(&raw)
            .map_err(|e| AppError::ExportError(format!("decode export data: {e}")))
    }
}

fn has_gz_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Bodies that parse as JSON are embedded as JSON values, everything
/// else as strings.
fn body_to_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn value_to_body(value: &Value) -> Result<Vec<u8>> {
    Ok(match value {
        Value::Null => Vec::new(),
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other)?,
    })
}

fn headers_to_map(raw: &str) -> Result<HashMap<String, String>> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(AppError::from)
}

pub fn to_export_interaction(interaction: Interaction) -> Result<ExportInteraction> {
    Ok(ExportInteraction {
        request_id: interaction.request_id.clone(),
        protocol: interaction.protocol,
        method: interaction.method.clone(),
        endpoint: interaction.endpoint.clone(),
        request: ExportRequest {
            headers: headers_to_map(&interaction.request_headers)?,
            body: body_to_value(&interaction.request_body),
        },
        response: ExportResponse {
            status: interaction.response_status,
            headers: headers_to_map(&interaction.response_headers)?,
            body: body_to_value(&interaction.response_body),
        },
        timestamp: interaction.timestamp,
        sequence_number: interaction.sequence_number,
    })
}

pub fn from_export_interaction(export: ExportInteraction) -> Result<Interaction> {
    let mut interaction = Interaction::new(export.protocol, export.method, export.endpoint);
    interaction.request_id = export.request_id;
    interaction.request_headers = serde_json::to_string(&export.request.headers)?;
    interaction.request_body = value_to_body(&export.request.body)?;
    interaction.response_status = export.response.status;
    interaction.response_headers = serde_json::to_string(&export.response.headers)?;
    interaction.response_body = value_to_body(&export.response.body)?;
    interaction.timestamp = export.timestamp;
    interaction.sequence_number = export.sequence_number;
    Ok(interaction)
}

/// Structural validation applied before anything touches the store.
pub fn validate_export(data: &ExportData) -> Result<()> {
    if data.version.is_empty() {
        return Err(AppError::ExportError("missing version field".into()));
    }
    if data.session.name.is_empty() {
        return Err(AppError::ExportError("missing session name".into()));
    }
    for (i, interaction) in data.interactions.iter().enumerate() {
        if interaction.request_id.is_empty() {
            return Err(AppError::ExportError(format!(
                "missing request ID in interaction {i}"
            )));
        }
        if interaction.method.is_empty() {
            return Err(AppError::ExportError(format!(
                "missing method in interaction {i}"
            )));
        }
        if interaction.endpoint.is_empty() {
            return Err(AppError::ExportError(format!(
                "missing endpoint in interaction {i}"
            )));
        }
    }
    Ok(())
}
