//! Fork- and version-scoped read paths: the cached fork manifest JSON, the
//! per-version manifest text, and on-disk artifact files.
//!
//! These are plain data-fetching functions; the HTTP-specific bits (status
//! codes, headers) live in `http::handlers`.

use crate::codec;
use crate::db::{ContentStore, ManifestStore};
use crate::error::{AppError, DbError, DownloadError};
use crate::hashing::ObjectHash;
use crate::layout::BuildLayout;

/// A version's manifest body, ready to be written to an HTTP response.
pub struct ManifestBody {
    pub hash: ObjectHash,
    pub bytes: Vec<u8>,
    /// Whether `bytes` is still zstd-compressed (caller must set
    /// `Content-Encoding: zstd`) or has been decompressed for the caller.
    pub zstd_encoded: bool,
}

/// Resolves the manifest body for `GET .../version/{v}/manifest`.
///
/// When `client_accepts_zstd`, the stored compressed bytes are returned
/// verbatim (spec.md 4.6): no decompress-then-recompress round trip.
pub fn version_manifest(
    content: &ContentStore,
    version_id: i64,
    client_accepts_zstd: bool,
) -> Result<Option<ManifestBody>, DownloadError> {
    let Some((hash, data, uncompressed_len)) = content.manifest_data(version_id)? else {
        return Ok(None);
    };

    if client_accepts_zstd {
        return Ok(Some(ManifestBody {
            hash,
            bytes: data,
            zstd_encoded: true,
        }));
    }

    let bytes = codec::zstd_decompress(&data, uncompressed_len as usize)?;
    Ok(Some(ManifestBody {
        hash,
        bytes,
        zstd_encoded: false,
    }))
}

/// The fork's cached server-manifest JSON blob, or `None` if it hasn't been
/// published yet (caller maps to 404, spec.md 4.7).
pub fn fork_manifest_json(manifest: &ManifestStore, fork: &str) -> Result<Option<Vec<u8>>, DbError> {
    manifest.get_server_manifest_cache(fork)
}

/// Reads an on-disk version artifact for `GET /fork/{fork}/version/{v}/file/{f}`.
///
/// `file` must already have passed `BuildLayout` sanitization, which rejects
/// `/`, `..`, and bare `.` components.
pub fn read_artifact(layout: &BuildLayout, fork: &str, version: &str, file: &str) -> Result<Vec<u8>, AppError> {
    let path = layout.artifact_path(fork, version, file)?;
    if !path.is_file() {
        return Err(AppError::NotFound(format!(
            "no such file: fork={fork} version={version} file={file}"
        )));
    }
    std::fs::read(&path).map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn version_manifest_decompresses_when_client_rejects_zstd() {
        let content = ContentStore::open(Path::new(":memory:"), 1).unwrap();
        let version_id = content.begin_content_version("wow", "1.0.0", "2026-01-01T00:00:00Z").unwrap();
        let text = b"Robust Content Manifest 1\n";
        let mut buf = crate::codec::CompressBuffer::new();
        let compressed = codec::zstd_compress(text, 3, &mut buf).unwrap();
        let hash = ObjectHash::hash(text);
        content
            .finish_content_version(version_id, &hash, &compressed, text.len() as i64, 0)
            .unwrap();

        let plain = version_manifest(&content, version_id, false).unwrap().unwrap();
        assert!(!plain.zstd_encoded);
        assert_eq!(plain.bytes, text);

        let raw = version_manifest(&content, version_id, true).unwrap().unwrap();
        assert!(raw.zstd_encoded);
        assert_eq!(raw.bytes, compressed);
    }

    #[test]
    fn fork_manifest_json_absent_until_published() {
        let manifest = ManifestStore::open(Path::new(":memory:"), 1).unwrap();
        manifest.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        assert!(fork_manifest_json(&manifest, "wow").unwrap().is_none());

        manifest.set_server_manifest_cache("wow", b"{}").unwrap();
        assert_eq!(fork_manifest_json(&manifest, "wow").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn read_artifact_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BuildLayout::new(tmp.path());
        let err = read_artifact(&layout, "wow", "1.0.0", "../../etc/passwd").unwrap_err();
        assert!(matches!(err, AppError::Layout(_)));
    }

    #[test]
    fn read_artifact_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("wow").join("1.0.0")).unwrap();
        let layout = BuildLayout::new(tmp.path());
        let err = read_artifact(&layout, "wow", "1.0.0", "client.zip").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
