//! SQLite-backed store for sessions, interactions and stream chunks
//!
//! The store is the transactional data plane shared by every engine.
//! Each operation opens its own connection against a WAL-mode database,
//! so readers never block each other and conflicting writers are
//! serialized by SQLite itself. Async callers run the blocking work on
//! `spawn_blocking`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::model::{Interaction, Protocol, Session, StreamChunk};

/// Handle to the recordings database.
///
/// Cloning is cheap; clones share the same underlying database file.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` and ensure the
    /// schema exists. A leading `~` is expanded to the user's home
    /// directory, and missing parent directories are created.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = expand_tilde(db_path.as_ref())?;
        if db_path.as_os_str().is_empty() {
            return Err(AppError::ConfigError(
                "database path cannot be empty".into(),
            ));
        }

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::storage("create database directory", e))?;
            }
        }

        let store = Self { db_path };
        let conn = store.connect()?;
        create_tables(&conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    pub async fn create_session(&self, name: &str, description: &str) -> Result<Session> {
        let store = self.clone();
        let (name, description) = (name.to_owned(), description.to_owned());
        run_blocking("create session", move || {
            create_session_blocking(&store.connect()?, &name, &description)
        })
        .await
    }

    /// Look up a session by name. Missing sessions are a distinguished
    /// error so callers can branch on it.
    pub async fn get_session(&self, name: &str) -> Result<Session> {
        let store = self.clone();
        let name = name.to_owned();
        run_blocking("get session", move || {
            get_session_blocking(&store.connect()?, &name)
        })
        .await
    }

    /// Idempotent on `name`: returns the existing session or creates it.
    pub async fn get_or_create_session(&self, name: &str, description: &str) -> Result<Session> {
        let store = self.clone();
        let (name, description) = (name.to_owned(), description.to_owned());
        run_blocking("get or create session", move || {
            let conn = store.connect()?;
            match get_session_blocking(&conn, &name) {
                Err(AppError::SessionNotFound(_)) => {
                    create_session_blocking(&conn, &name, &description)
                }
                other => other,
            }
        })
        .await
    }

    /// All sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let store = self.clone();
        run_blocking("list sessions", move || {
            let conn = store.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, session_name, created_at, description
                 FROM sessions ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], session_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    /// Insert an interaction, assigning its per-`(session, endpoint)`
    /// sequence number and timestamp inside a write transaction. The
    /// returned interaction carries the populated `id`,
    /// `sequence_number` and `timestamp`.
    ///
    /// The transaction takes the write lock up front, so concurrent
    /// recordings against the same endpoint observe strictly increasing
    /// sequence numbers. Fails if `request_id` is not unique.
    pub async fn record_interaction(&self, interaction: Interaction) -> Result<Interaction> {
        let store = self.clone();
        run_blocking("record interaction", move || {
            let mut conn = store.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut interaction = interaction;
            interaction.sequence_number =
                next_sequence_number(&tx, interaction.session_id, &interaction.endpoint)?;
            interaction.timestamp = Utc::now();

            insert_interaction(&tx, &interaction)?;
            interaction.id = tx.last_insert_rowid();
            tx.commit()?;

            debug!(
                endpoint = %interaction.endpoint,
                sequence = interaction.sequence_number,
                "recorded interaction"
            );
            Ok(interaction)
        })
        .await
    }

    /// Candidate interactions for mock lookup, ascending by sequence.
    pub async fn find_matching_interactions(
        &self,
        session_id: i64,
        method: &str,
        endpoint: &str,
    ) -> Result<Vec<Interaction>> {
        let store = self.clone();
        let (method, endpoint) = (method.to_owned(), endpoint.to_owned());
        run_blocking("find matching interactions", move || {
            let conn = store.connect()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE session_id = ?1 AND method = ?2 AND endpoint = ?3
                 ORDER BY sequence_number ASC",
            ))?;
            let rows =
                stmt.query_map(params![session_id, method, endpoint], interaction_from_row)?;
            collect_interactions(rows)
        })
        .await
    }

    /// All interactions of a session, ascending by sequence.
    pub async fn get_interactions_by_session(&self, session_id: i64) -> Result<Vec<Interaction>> {
        let store = self.clone();
        run_blocking("get interactions by session", move || {
            let conn = store.connect()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE session_id = ?1 ORDER BY sequence_number ASC",
            ))?;
            let rows = stmt.query_map(params![session_id], interaction_from_row)?;
            collect_interactions(rows)
        })
        .await
    }

    /// All-or-nothing batch insert of the chunks of one streaming
    /// response. An empty slice is a successful no-op.
    pub async fn record_stream_chunks(&self, chunks: Vec<StreamChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let store = self.clone();
        run_blocking("record stream chunks", move || {
            let mut conn = store.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO stream_chunks
                       (interaction_id, chunk_index, data, timestamp, time_delta)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.interaction_id,
                        chunk.chunk_index,
                        chunk.data,
                        chunk.timestamp.to_rfc3339(),
                        chunk.time_delta_ms,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Annotate an interaction whose chunk batch (partially) failed,
    /// without reverting the interaction row itself.
    pub async fn mark_interaction_as_partial(
        &self,
        interaction_id: i64,
        failed_chunks: Vec<i64>,
    ) -> Result<()> {
        let store = self.clone();
        run_blocking("mark interaction as partial", move || {
            let metadata = serde_json::json!({
                "status": "partial",
                "failed_chunks": failed_chunks,
            });
            let conn = store.connect()?;
            conn.execute(
                "UPDATE interactions SET metadata = ?1 WHERE id = ?2",
                params![metadata.to_string(), interaction_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Chunks of one interaction, ascending by `chunk_index`.
    pub async fn get_stream_chunks(&self, interaction_id: i64) -> Result<Vec<StreamChunk>> {
        let store = self.clone();
        run_blocking("get stream chunks", move || {
            let conn = store.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, interaction_id, chunk_index, data, timestamp, time_delta
                 FROM stream_chunks WHERE interaction_id = ?1
                 ORDER BY chunk_index ASC",
            )?;
            let rows = stmt.query_map(params![interaction_id], chunk_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    /// Delete a session's chunks, interactions and finally the session
    /// row, in one transaction.
    pub async fn clear_session(&self, name: &str) -> Result<()> {
        let store = self.clone();
        let name = name.to_owned();
        run_blocking("clear session", move || {
            let mut conn = store.connect()?;
            let session = get_session_blocking(&conn, &name)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM stream_chunks WHERE interaction_id IN
                   (SELECT id FROM interactions WHERE session_id = ?1)",
                params![session.id],
            )?;
            tx.execute(
                "DELETE FROM interactions WHERE session_id = ?1",
                params![session.id],
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![session.id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Same cascade as [`Store::clear_session`], globally.
    pub async fn clear_all(&self) -> Result<()> {
        let store = self.clone();
        run_blocking("clear all sessions", move || {
            let mut conn = store.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM stream_chunks", [])?;
            tx.execute("DELETE FROM interactions", [])?;
            tx.execute("DELETE FROM sessions", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Insert pre-built interactions (import path), reusing or creating
    /// the target session, in a single transaction.
    pub async fn import_interactions(
        &self,
        session_name: &str,
        interactions: Vec<Interaction>,
    ) -> Result<()> {
        let store = self.clone();
        let session_name = session_name.to_owned();
        run_blocking("import interactions", move || {
            let mut conn = store.connect()?;
            let session = match get_session_blocking(&conn, &session_name) {
                Err(AppError::SessionNotFound(_)) => {
                    create_session_blocking(&conn, &session_name, "Imported session")?
                }
                other => other?,
            };
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for mut interaction in interactions {
                interaction.session_id = session.id;
                insert_interaction(&tx, &interaction)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Import a single interaction together with its stream chunks.
    pub async fn import_interaction_with_chunks(
        &self,
        session_name: &str,
        interaction: Interaction,
        chunks: Vec<StreamChunk>,
    ) -> Result<()> {
        let store = self.clone();
        let session_name = session_name.to_owned();
        run_blocking("import interaction with chunks", move || {
            let mut conn = store.connect()?;
            let session = match get_session_blocking(&conn, &session_name) {
                Err(AppError::SessionNotFound(_)) => {
                    create_session_blocking(&conn, &session_name, "Imported session")?
                }
                other => other?,
            };
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut interaction = interaction;
            interaction.session_id = session.id;
            insert_interaction(&tx, &interaction)?;
            let interaction_id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO stream_chunks
                       (interaction_id, chunk_index, data, timestamp, time_delta)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for chunk in &chunks {
                    stmt.execute(params![
                        interaction_id,
                        chunk.chunk_index,
                        chunk.data,
                        chunk.timestamp.to_rfc3339(),
                        chunk.time_delta_ms,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::storage(op, format!("join task: {e}")))?
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Some(s) = path.to_str() else {
        return Ok(path.to_path_buf());
    };
    if let Some(rest) = s.strip_prefix('~') {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| AppError::ConfigError("cannot resolve home directory".into()))?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    Ok(path.to_path_buf())
}

fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|e| AppError::storage("open database", e))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    Ok(conn)
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_name TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            request_id TEXT UNIQUE NOT NULL,
            protocol TEXT NOT NULL CHECK(protocol IN ('REST', 'gRPC')),
            method TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            request_headers TEXT,
            request_body BLOB,
            response_status INTEGER,
            response_headers TEXT,
            response_body BLOB,
            timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            sequence_number INTEGER NOT NULL,
            metadata TEXT,
            is_streaming INTEGER DEFAULT 0,
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        );

        CREATE TABLE IF NOT EXISTS stream_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            interaction_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            data BLOB,
            timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            time_delta INTEGER DEFAULT 0,
            FOREIGN KEY (interaction_id) REFERENCES interactions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_endpoint_method ON interactions(endpoint, method);
        CREATE INDEX IF NOT EXISTS idx_session_sequence ON interactions(session_id, sequence_number);
        CREATE INDEX IF NOT EXISTS idx_request_id ON interactions(request_id);
        CREATE INDEX IF NOT EXISTS idx_stream_chunks ON stream_chunks(interaction_id, chunk_index);
        "#,
    )
    .map_err(|e| AppError::storage("create tables", e))
}

fn create_session_blocking(conn: &Connection, name: &str, description: &str) -> Result<Session> {
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO sessions (session_name, created_at, description) VALUES (?1, ?2, ?3)",
        params![name, created_at.to_rfc3339(), description],
    )
    .map_err(|e| AppError::storage("create session", e))?;

    Ok(Session {
        id: conn.last_insert_rowid(),
        name: name.to_owned(),
        created_at,
        description: description.to_owned(),
    })
}

fn get_session_blocking(conn: &Connection, name: &str) -> Result<Session> {
    let mut stmt = conn.prepare(
        "SELECT id, session_name, created_at, description FROM sessions WHERE session_name = ?1",
    )?;
    let mut rows = stmt.query_map(params![name], session_from_row)?;
    match rows.next() {
        Some(row) => row.map_err(AppError::from),
        None => Err(AppError::SessionNotFound(name.to_owned())),
    }
}

const INTERACTION_COLUMNS: &str = "id, session_id, request_id, protocol, method, endpoint, \
     request_headers, request_body, response_status, response_headers, \
     response_body, timestamp, sequence_number, metadata, is_streaming";

fn next_sequence_number(conn: &Connection, session_id: i64, endpoint: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM interactions
         WHERE session_id = ?1 AND endpoint = ?2",
        params![session_id, endpoint],
        |row| row.get(0),
    )
    .map_err(|e| AppError::storage("get next sequence number", e))
}

fn insert_interaction(conn: &Connection, interaction: &Interaction) -> Result<()> {
    conn.execute(
        "INSERT INTO interactions (
            session_id, request_id, protocol, method, endpoint,
            request_headers, request_body, response_status, response_headers,
            response_body, timestamp, sequence_number, metadata, is_streaming
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            interaction.session_id,
            interaction.request_id,
            interaction.protocol.as_str(),
            interaction.method,
            interaction.endpoint,
            interaction.request_headers,
            interaction.request_body,
            interaction.response_status,
            interaction.response_headers,
            interaction.response_body,
            interaction.timestamp.to_rfc3339(),
            interaction.sequence_number,
            interaction.metadata,
            interaction.is_streaming as i64,
        ],
    )
    .map_err(|e| AppError::storage("insert interaction", e))?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_timestamp(&row.get::<_, String>(2)?),
        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
    })
}

fn interaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Interaction> {
    let protocol_tag: String = row.get(3)?;
    let protocol = Protocol::parse(&protocol_tag).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("invalid protocol tag {protocol_tag}").into(),
        )
    })?;

    Ok(Interaction {
        id: row.get(0)?,
        session_id: row.get(1)?,
        request_id: row.get(2)?,
        protocol,
        method: row.get(4)?,
        endpoint: row.get(5)?,
        request_headers: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        request_body: row.get::<_, Option<Vec<u8>>>(7)?.unwrap_or_default(),
        response_status: row.get::<_, Option<i32>>(8)?.unwrap_or_default(),
        response_headers: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        response_body: row.get::<_, Option<Vec<u8>>>(10)?.unwrap_or_default(),
        timestamp: parse_timestamp(&row.get::<_, String>(11)?),
        sequence_number: row.get(12)?,
        metadata: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        is_streaming: row.get::<_, i64>(14)? != 0,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreamChunk> {
    Ok(StreamChunk {
        id: row.get(0)?,
        interaction_id: row.get(1)?,
        chunk_index: row.get(2)?,
        data: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
        timestamp: parse_timestamp(&row.get::<_, String>(4)?),
        time_delta_ms: row.get(5)?,
    })
}

fn collect_interactions(
    rows: impl Iterator<Item = rusqlite::Result<Interaction>>,
) -> Result<Vec<Interaction>> {
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(AppError::from)
}
