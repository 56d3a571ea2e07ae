//! Robust CDN server binary entry point.
//!
//! This is a thin wrapper around the `robust_cdn` library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Loads and validates configuration
//! 4. Either runs pending migrations and exits, or starts the server
//!
//! For library usage, see the `robust_cdn` crate documentation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use robust_cdn::config::{Cli, Command, Settings};
use robust_cdn::db::{ContentStore, ManifestStore};
use robust_cdn::{AppState, http, scheduler};

/// How often the prune job sweeps for builds past their fork's
/// `prune_builds_days` threshold.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often the stale-publish cleanup job sweeps for abandoned
/// multi-request publishes.
const STALE_PUBLISH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse_args();
    let settings = Settings::load(&cli.config)?;
    settings.validate()?;

    if matches!(cli.command, Some(Command::Migrate)) {
        tracing::info!("running migrations");
        ContentStore::open(&settings.cdn.database_file_name, 1)?;
        ManifestStore::open(&settings.manifest.database_file_name, 1)?;
        tracing::info!("migrations complete");
        return Ok(());
    }

    tracing::info!(http_bind = %cli.http_bind, "robust-cdn starting");

    let state = AppState::new(settings)?;

    spawn_prune_job(state.clone());
    spawn_stale_publish_job(state.clone());

    http::start_server(cli.http_bind, state).await?;
    Ok(())
}

fn spawn_prune_job(state: Arc<AppState>) {
    scheduler::spawn_interval("prune", PRUNE_INTERVAL, move || {
        let state = state.clone();
        async move { run_prune_once(&state) }
    });
}

fn spawn_stale_publish_job(state: Arc<AppState>) {
    scheduler::spawn_interval("stale-publish-cleanup", STALE_PUBLISH_INTERVAL, move || {
        let state = state.clone();
        async move { run_stale_publish_cleanup_once(&state) }
    });
}

/// Deletes every `ForkVersion` whose fork configures `prune_builds_days` and
/// whose age exceeds it, along with its on-disk artifacts.
fn run_prune_once(state: &AppState) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    for version in state.manifest.prunable_versions(&now)? {
        let version_dir = state.layout.version_dir(&version.fork, &version.name)?;
        let _ = std::fs::remove_dir_all(&version_dir);
        state.manifest.delete_version(version.id)?;
        tracing::info!(fork = version.fork, version = version.name, "pruned build");
    }
    Ok(())
}

/// Aborts any `PublishInProgress` row older than the configured timeout,
/// removing its partial on-disk artifacts.
fn run_stale_publish_cleanup_once(state: &AppState) -> Result<()> {
    let timeout = chrono::Duration::minutes(state.settings.manifest.in_progress_publish_timeout_minutes);
    let cutoff = (chrono::Utc::now() - timeout).to_rfc3339();
    for (fork, version) in state.manifest.stale_publishes(&cutoff)? {
        let version_dir = state.layout.version_dir(&fork, &version)?;
        let _ = std::fs::remove_dir_all(&version_dir);
        state.manifest.finish_publish(&fork, &version)?;
        tracing::warn!(fork, version, "aborted stale in-progress publish");
    }
    Ok(())
}
