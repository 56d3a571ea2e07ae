//! Shared application state, handed to every HTTP handler via axum's
//! `State` extractor.

use std::sync::Arc;
use std::time::SystemTime;

use crate::config::Settings;
use crate::db::{ContentStore, ManifestStore};
use crate::error::ConfigError;
use crate::layout::BuildLayout;
use crate::requestlog::RequestLogSink;
use crate::scheduler::JobScheduler;

/// Connections-per-store in the round-robin pool. Sized for a handful of
/// concurrent request-serving tasks plus background jobs.
const POOL_SIZE: usize = 4;

pub struct AppState {
    pub settings: Settings,
    pub content: Arc<ContentStore>,
    pub manifest: Arc<ManifestStore>,
    pub layout: BuildLayout,
    pub scheduler: JobScheduler,
    pub request_log: RequestLogSink,
    pub http: reqwest::Client,
    pub started_at: SystemTime,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Arc<Self>, ConfigError> {
        let content = Arc::new(
            ContentStore::open(&settings.cdn.database_file_name, POOL_SIZE)
                .map_err(|e| ConfigError::Invalid {
                    field: "cdn.database_file_name".to_string(),
                    reason: e.to_string(),
                })?,
        );
        let manifest = Arc::new(
            ManifestStore::open(&settings.manifest.database_file_name, POOL_SIZE)
                .map_err(|e| ConfigError::Invalid {
                    field: "manifest.database_file_name".to_string(),
                    reason: e.to_string(),
                })?,
        );

        for (name, fork) in &settings.manifest.forks {
            let private_users_json = serde_json::to_string(&fork.private_users).unwrap_or_default();
            let notify_watchdogs_json = serde_json::to_string(&fork.notify_watchdogs).unwrap_or_default();
            manifest
                .upsert_fork(
                    name,
                    &fork.update_token,
                    &fork.client_zip_name,
                    &fork.server_zip_name,
                    fork.private,
                    &private_users_json,
                    &notify_watchdogs_json,
                    fork.prune_builds_days,
                )
                .map_err(|e| ConfigError::Invalid {
                    field: format!("manifest.forks.{name}"),
                    reason: e.to_string(),
                })?;
        }

        let layout = BuildLayout::new(settings.manifest.file_disk_path.clone());
        let request_log = RequestLogSink::spawn(settings.cdn.log_request_storage, content.clone());

        Ok(Arc::new(Self {
            settings,
            content,
            manifest,
            layout,
            scheduler: JobScheduler::new(),
            request_log,
            http: reqwest::Client::new(),
            started_at: SystemTime::now(),
        }))
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
            .as_secs()
    }
}
