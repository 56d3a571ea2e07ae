//! Availability flip, manifest-cache rebuild, and watchdog-notify jobs.
//!
//! Ordered strictly after ingestion (spec.md 4.4): a version only becomes
//! visible once its content is flipped available *and* the fork's cached
//! JSON manifest has been republished to reflect it.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Settings;
use crate::db::{ContentStore, ManifestStore};
use crate::error::ConfigError;

/// Flips `Available = true` on every `ForkVersion` whose matching
/// `ContentVersion` has completed ingestion, then rebuilds the fork's cached
/// manifest.
pub fn flip_available_and_rebuild(
    content: &ContentStore,
    manifest: &ManifestStore,
    settings: &Settings,
    fork: &str,
    ingested_versions: &[String],
) -> anyhow::Result<()> {
    for version in ingested_versions {
        if content.has_version(fork, version)? {
            manifest.set_available(fork, version, true)?;
        }
    }
    rebuild_manifest_cache(manifest, settings, fork)?;
    Ok(())
}

#[derive(Serialize)]
struct ManifestDocument {
    builds: HashMap<String, BuildEntry>,
}

#[derive(Serialize)]
struct BuildEntry {
    time: String,
    client: ArtifactEntry,
    server: HashMap<String, ArtifactEntry>,
}

#[derive(Serialize)]
struct ArtifactEntry {
    url: String,
    sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<i64>,
}

/// Rebuilds `Fork.ServerManifestCache` from every currently-available
/// version. `settings.base_url` must end with `/`; this is enforced by
/// `Settings::validate` at startup so the job cannot fail on it here.
pub fn rebuild_manifest_cache(manifest: &ManifestStore, settings: &Settings, fork: &str) -> anyhow::Result<()> {
    if !settings.base_url.ends_with('/') {
        return Err(ConfigError::BaseUrlMissingTrailingSlash(settings.base_url.clone()).into());
    }

    let versions = manifest.available_versions(fork, 1_000_000)?;
    let mut builds = HashMap::with_capacity(versions.len());

    for version in versions {
        let client_url = settings.file_url(fork, &version.name, &version.client_zip_name);
        let mut server = HashMap::new();
        for build in manifest.server_builds(version.id)? {
            let url = settings.file_url(fork, &version.name, &build.file_name);
            server.insert(
                build.platform,
                ArtifactEntry {
                    url,
                    sha256: build.sha256,
                    size: build.size,
                },
            );
        }
        builds.insert(
            version.name,
            BuildEntry {
                time: version.publish_time,
                client: ArtifactEntry {
                    url: client_url,
                    sha256: version.client_zip_sha256,
                    size: None,
                },
                server,
            },
        );
    }

    let document = ManifestDocument { builds };
    let json = serde_json::to_vec(&document)?;
    manifest.set_server_manifest_cache(fork, &json)?;
    Ok(())
}

/// POSTs `instances/<instance>/update` to each configured watchdog target.
/// Each notify is independent; failures are logged, never retried or
/// propagated (spec.md 4.4, 7).
pub async fn notify_watchdogs(client: &reqwest::Client, fork: &str, targets: &[crate::config::WatchdogTarget]) {
    for target in targets {
        let url = format!("{}instances/{}/update", target.url.trim_end_matches('/'), target.instance);
        let result = client
            .post(&url)
            .basic_auth(&target.instance, Some(&target.api_token))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(fork, instance = target.instance, "notified watchdog");
            }
            Ok(response) => {
                tracing::warn!(fork, instance = target.instance, status = %response.status(), "watchdog notify returned non-success status");
            }
            Err(err) => {
                tracing::warn!(fork, instance = target.instance, error = %err, "watchdog notify failed");
            }
        }
    }
}
