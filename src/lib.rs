//! Content-distribution server for published game builds.
//!
//! Ingests client/server zip archives published by a build pipeline, stores
//! their contents in a content-addressed, deduplicated blob store, and serves
//! them to game clients through a manifest/partial-download protocol.
//!
//! # Architecture
//!
//! - `config`: configuration loading (CLI + TOML settings file) and validation
//! - `error`: error types, composed into `AppError` at the HTTP boundary
//! - `hashing`: BLAKE2b-256 hashing and streaming reader/writer wrappers
//! - `codec`: zstd compression helpers and the "worth compressing" predicate
//! - `layout`: safe resolution of `<root>/<fork>/<version>/<file>` paths
//! - `db`: pooled access to the content store and manifest store
//! - `auth`: constant-time bearer and basic-auth checks
//! - `scheduler`: keyed non-reentrant background job scheduler
//! - `requestlog`: bounded single-consumer request-log sink
//! - `ingest`: ingestion pipeline (zip -> dedup blobs -> manifest)
//! - `availability`: availability flip, manifest-cache rebuild, watchdog notify
//! - `publish`: one-shot and multi-request publish workflow
//! - `download`: manifest/download wire protocol
//! - `fileserve`: fork-scoped manifest cache and artifact serving
//! - `state`: shared application state
//! - `http`: axum router and handlers

pub mod auth;
pub mod availability;
pub mod codec;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod fileserve;
pub mod hashing;
pub mod http;
pub mod ingest;
pub mod layout;
pub mod publish;
pub mod requestlog;
pub mod scheduler;
pub mod state;

pub use config::Settings;
pub use error::AppError;
pub use state::AppState;
