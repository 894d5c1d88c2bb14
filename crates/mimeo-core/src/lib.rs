//! Mimeo Core Library
//!
//! Engines and data plane for the mimeo record/replay proxy. This crate
//! is independent of the CLI: it provides the store, the protocol
//! handlers and codecs, and the record/mock/replay engines that the
//! binary wires onto listeners.
//!
//! # Modules
//!
//! - [`model`] - Sessions, interactions and stream chunks
//! - [`storage`] - SQLite-backed transactional store
//! - [`config`] - Configuration types and validation
//! - [`rest`] - HTTP extraction, redaction and path matching
//! - [`sse`] - Server-Sent Events framing with per-chunk timing
//! - [`matching`] - Request-content fine matching for mock mode
//! - [`record`] - Record engine (forward upstream, capture, persist)
//! - [`mock`] - Mock engine (serve recordings, sequence cursor)
//! - [`replay`] - Replay engine (re-issue and validate)
//! - [`grpc`] - Raw codec, router and gRPC engines
//! - [`export`] - JSON export/import of sessions
//! - [`events`] - Observer interface for live traffic events
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod grpc;
pub mod matching;
pub mod mock;
pub mod model;
pub mod record;
pub mod replay;
pub mod rest;
pub mod sse;
pub mod storage;

// Re-export commonly used types
pub use config::{Config, MatchingStrategy, Mode, RouteProtocol, ValidationStrategy};
pub use error::{AppError, Result};
pub use events::{NoOpObserver, Observer, RequestEvent, ResponseEvent};
pub use export::{Exporter, MergeStrategy};
pub use grpc::{GrpcDestination, GrpcMock, GrpcProxy, GrpcRoute, GrpcRouter};
pub use mock::MockEngine;
pub use model::{Interaction, Protocol, Session, StreamChunk};
pub use record::RecordEngine;
pub use replay::{ReplayEngine, ReplayReport, ReplayResult};
pub use storage::Store;
