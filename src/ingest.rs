//! Ingestion pipeline: scans a fork's build directory for new versions and
//! dedup-inserts their client zip contents into the content store.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zip::ZipArchive;

use crate::config::CdnSettings;
use crate::db::ContentStore;
use crate::db::content::PendingEntry;
use crate::error::IngestError;
use crate::hashing::ObjectHash;
use crate::layout::BuildLayout;

/// Each version is ingested inside its own transaction (see
/// `ContentStore::ingest_version`); this just bounds how much WAL
/// accumulates across one `discover_and_ingest` call by checkpointing every
/// N versions rather than leaving it all to the next automatic checkpoint.
const INTERIM_COMMIT_BATCH: usize = 5;

pub struct IngestOutcome {
    pub ingested: Vec<String>,
    pub skipped_missing_client: Vec<String>,
}

/// Discovers candidate version directories for `fork` and ingests any not
/// already present in the content store, newest directory first.
pub fn discover_and_ingest(
    content: &ContentStore,
    layout: &BuildLayout,
    cdn: &CdnSettings,
    fork: &str,
    client_zip_name: &str,
) -> Result<IngestOutcome, IngestError> {
    let mut candidates = layout.list_version_dirs(fork)?;
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut outcome = IngestOutcome {
        ingested: Vec::new(),
        skipped_missing_client: Vec::new(),
    };

    for (count, (dir, _modified)) in candidates.iter().enumerate() {
        let Some(version) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if content.has_version(fork, version)? {
            continue;
        }

        let client_zip_path = dir.join(format!("{client_zip_name}.zip"));
        if !client_zip_path.exists() {
            tracing::warn!(fork, version, "skipping version with missing client zip");
            outcome.skipped_missing_client.push(version.to_string());
            continue;
        }

        ingest_one_version(content, cdn, fork, version, &client_zip_path)?;
        outcome.ingested.push(version.to_string());

        if (count + 1) % INTERIM_COMMIT_BATCH == 0 {
            content.checkpoint()?;
            tracing::debug!(fork, ingested = count + 1, "interim ingestion checkpoint");
        }
    }

    Ok(outcome)
}

/// Ingests a single version's client zip into the content store.
fn ingest_one_version(
    content: &ContentStore,
    cdn: &CdnSettings,
    fork: &str,
    version: &str,
    client_zip_path: &Path,
) -> Result<(), IngestError> {
    let publish_time = chrono::Utc::now().to_rfc3339();

    let file = File::open(client_zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|source| IngestError::OpenZip {
        path: client_zip_path.display().to_string(),
        source,
    })?;

    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).map(|f| f.name().to_string()))
        .collect::<Result<_, _>>()
        .map_err(|source| IngestError::OpenZip {
            path: client_zip_path.display().to_string(),
            source,
        })?;
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in &names {
        let mut entry = archive.by_name(name).map_err(|source| IngestError::OpenZip {
            path: client_zip_path.display().to_string(),
            source,
        })?;
        if entry.is_dir() || name.ends_with('/') {
            continue;
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        let hash = ObjectHash::hash(&data);
        entries.push(PendingEntry {
            hash,
            name: name.clone(),
            data,
        });
    }

    let entry_count = entries.len();
    let version_id = content.ingest_version(
        fork,
        version,
        &publish_time,
        cdn.blob_compress,
        cdn.blob_compress_level,
        cdn.blob_compress_savings_threshold,
        cdn.manifest_compress_level,
        &entries,
    )?;
    let distinct_blobs = content.distinct_blob_count(version_id)?;

    tracing::info!(fork, version, entries = entry_count, distinct_blobs, "ingested version");
    Ok(())
}
