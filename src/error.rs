//! Error types for the CDN server.
//!
//! Each concern gets its own `thiserror` enum; [`AppError`] composes them at
//! the HTTP boundary and maps to the status codes described by the protocol.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingRequired(String),

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("base URL must end with '/': {0}")]
    BaseUrlMissingTrailingSlash(String),
}

/// Database access errors, shared by the content and manifest stores.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration {script} failed: {source}")]
    Migration {
        script: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build-directory layout errors.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid fork name: {0}")]
    InvalidFork(String),

    #[error("invalid version name: {0}")]
    InvalidVersion(String),

    #[error("invalid file name: {0}")]
    InvalidFile(String),
}

/// Ingestion pipeline errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("failed to open client zip {path}: {source}")]
    OpenZip {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publish workflow errors.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("no client artifact present in published archive")]
    MissingClientArtifact,

    #[error("version {fork}/{version} already exists")]
    VersionExists { fork: String, version: String },

    #[error("file {0} was already uploaded for this publish")]
    FileExists(String),

    #[error("fetching remote archive failed: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Download endpoint errors.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("request body size {0} exceeds the maximum allowed")]
    BodyTooLarge(usize),

    #[error("request body length {0} is not a multiple of 4")]
    BodyNotAligned(usize),

    #[error("manifest index {index} out of bounds (entries = {entries})")]
    IndexOutOfBounds { index: i32, entries: usize },

    #[error("duplicate manifest index {0} in request")]
    DuplicateIndex(i32),

    #[error("unsupported download protocol version {0}")]
    UnsupportedProtocol(i32),

    #[error("io error writing download stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Authentication/authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or invalid bearer token")]
    InvalidBearer,

    #[error("missing or invalid basic auth credentials")]
    InvalidBasic { realm: String },
}

/// Top-level HTTP-facing error, composing all of the above.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("request body too large")]
    TooLarge,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DownloadError> for AppError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::BodyTooLarge(_) => Self::TooLarge,
            DownloadError::BodyNotAligned(_)
            | DownloadError::IndexOutOfBounds { .. }
            | DownloadError::DuplicateIndex(_)
            | DownloadError::UnsupportedProtocol(_) => Self::BadRequest(e.to_string()),
            DownloadError::Db(db) => Self::Db(db),
            DownloadError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<PublishError> for AppError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::MissingClientArtifact => Self::Unprocessable(e.to_string()),
            PublishError::VersionExists { .. } | PublishError::FileExists(_) => {
                Self::Conflict(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Auth(AuthError::InvalidBearer) => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            Self::Auth(AuthError::InvalidBasic { realm }) => {
                tracing::warn!(realm, "basic auth failed");
                return (
                    StatusCode::UNAUTHORIZED,
                    [("WWW-Authenticate", format!("Basic realm={realm}"))],
                    "unauthorized",
                )
                    .into_response();
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            Self::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            other => {
                tracing::error!(error = %other, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, message).into_response()
    }
}
