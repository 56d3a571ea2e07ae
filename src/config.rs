//! Server configuration: CLI arguments plus a TOML settings file.
//!
//! Bind address and the settings-file path come from the CLI (with
//! environment-variable fallbacks, matching the teacher's pattern); everything
//! fork-specific and storage-specific lives in the TOML file pointed to by
//! `--config`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level CLI entry point.
#[derive(Debug, Clone, Parser)]
#[command(name = "robust-cdn", about = "Content-distribution server for published game builds", version)]
pub struct Cli {
    /// HTTP bind address.
    #[arg(long, env = "ROBUST_CDN_HTTP_BIND", default_value = "0.0.0.0:8080")]
    pub http_bind: SocketAddr,

    /// Path to the TOML settings file.
    #[arg(long, env = "ROBUST_CDN_CONFIG", default_value = "./robust-cdn.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run pending database migrations and exit.
    Migrate,
    /// Run the server (the default when no subcommand is given).
    Serve,
}

impl Cli {
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Settings loaded from the TOML file named by `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub base_url: String,
    #[serde(default)]
    pub path_base: Option<String>,
    #[serde(default)]
    pub default_fork: Option<String>,
    pub cdn: CdnSettings,
    pub manifest: ManifestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdnSettings {
    #[serde(default = "default_cdn_db_file")]
    pub database_file_name: PathBuf,
    pub version_disk_path: PathBuf,
    #[serde(default = "default_true")]
    pub blob_compress: bool,
    #[serde(default = "default_blob_compress_level")]
    pub blob_compress_level: i32,
    #[serde(default = "default_blob_compress_threshold")]
    pub blob_compress_savings_threshold: usize,
    #[serde(default = "default_manifest_compress_level")]
    pub manifest_compress_level: i32,
    #[serde(default)]
    pub stream_compress: bool,
    #[serde(default = "default_stream_compress_level")]
    pub stream_compress_level: i32,
    #[serde(default)]
    pub send_pre_compressed: bool,
    #[serde(default = "default_auto_stream_compress_ratio")]
    pub auto_stream_compress_ratio: f64,
    #[serde(default)]
    pub log_requests: bool,
    #[serde(default)]
    pub log_request_storage: RequestLogStorage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RequestLogStorage {
    #[default]
    None,
    Console,
    Database,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSettings {
    #[serde(default = "default_manifest_db_file")]
    pub database_file_name: PathBuf,
    pub file_disk_path: PathBuf,
    #[serde(default = "default_in_progress_timeout_minutes")]
    pub in_progress_publish_timeout_minutes: i64,
    pub forks: HashMap<String, ForkSettings>,
}

/// Per-fork configuration; corresponds to the `Fork` row upserted at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ForkSettings {
    pub update_token: String,
    pub client_zip_name: String,
    pub server_zip_name: String,
    #[serde(default)]
    pub notify_watchdogs: Vec<WatchdogTarget>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub private_users: HashMap<String, String>,
    #[serde(default)]
    pub prune_builds_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogTarget {
    pub url: String,
    pub instance: String,
    pub api_token: String,
}

fn default_true() -> bool {
    true
}

fn default_cdn_db_file() -> PathBuf {
    PathBuf::from("content.db")
}

fn default_manifest_db_file() -> PathBuf {
    PathBuf::from("manifest.db")
}

fn default_blob_compress_level() -> i32 {
    9
}

fn default_manifest_compress_level() -> i32 {
    19
}

fn default_stream_compress_level() -> i32 {
    6
}

fn default_blob_compress_threshold() -> usize {
    64
}

fn default_auto_stream_compress_ratio() -> f64 {
    0.0
}

fn default_in_progress_timeout_minutes() -> i64 {
    60
}

impl Settings {
    /// Loads and validates settings from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Self = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates cross-field invariants that serde defaults can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.ends_with('/') {
            return Err(ConfigError::BaseUrlMissingTrailingSlash(self.base_url.clone()));
        }
        if self.manifest.forks.is_empty() {
            return Err(ConfigError::MissingRequired("manifest.forks".to_string()));
        }
        for (name, fork) in &self.manifest.forks {
            if fork.update_token.is_empty() {
                return Err(ConfigError::Invalid {
                    field: format!("manifest.forks.{name}.update_token"),
                    reason: "must not be empty".to_string(),
                });
            }
            if fork.private && fork.private_users.is_empty() {
                return Err(ConfigError::Invalid {
                    field: format!("manifest.forks.{name}.private_users"),
                    reason: "private fork requires at least one user".to_string(),
                });
            }
        }
        if let Some(default_fork) = &self.default_fork
            && !self.manifest.forks.contains_key(default_fork)
        {
            return Err(ConfigError::Invalid {
                field: "default_fork".to_string(),
                reason: format!("fork {default_fork} is not configured"),
            });
        }
        Ok(())
    }

    /// Resolves a public URL for `fork/<fork>/version/<version>/file/<file>`.
    #[must_use]
    pub fn file_url(&self, fork: &str, version: &str, file: &str) -> String {
        format!("{}fork/{fork}/version/{version}/file/{file}", self.base_url)
    }
}
