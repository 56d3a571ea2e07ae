//! Manifest/download wire protocol (spec.md 4.6).
//!
//! All protocol integers are little-endian `i32`; never assume host byte
//! order (spec.md 9).

use std::io::Write;

use crate::codec::{self, Compression};
use crate::config::CdnSettings;
use crate::db::ContentStore;
use crate::error::DownloadError;

pub const MIN_PROTOCOL: i32 = 1;
pub const MAX_PROTOCOL: i32 = 1;

/// Request body size cap: `4 * 100_000` bytes (spec.md 4.6).
pub const MAX_REQUEST_BODY_BYTES: usize = 4 * 100_000;

const PRE_COMPRESSED_FLAG: u32 = 0b1;

/// Parses and validates a download request body into manifest indices.
///
/// Every index must be in `0..entries_count`; duplicates are rejected.
pub fn parse_indices(body: &[u8], entries_count: i64) -> Result<Vec<i32>, DownloadError> {
    if body.len() > MAX_REQUEST_BODY_BYTES {
        return Err(DownloadError::BodyTooLarge(body.len()));
    }
    if body.len() % 4 != 0 {
        return Err(DownloadError::BodyNotAligned(body.len()));
    }

    let mut seen = std::collections::HashSet::with_capacity(body.len() / 4);
    let mut indices = Vec::with_capacity(body.len() / 4);
    for chunk in body.chunks_exact(4) {
        let index = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if index < 0 || i64::from(index) >= entries_count {
            return Err(DownloadError::IndexOutOfBounds {
                index,
                entries: entries_count as usize,
            });
        }
        if !seen.insert(index) {
            return Err(DownloadError::DuplicateIndex(index));
        }
        indices.push(index);
    }
    Ok(indices)
}

/// Resolves effective (streamCompress, preCompress) flags per spec.md 4.6's
/// auto-selection heuristic.
#[must_use]
pub fn resolve_compression_strategy(
    cdn: &CdnSettings,
    requested_count: usize,
    distinct_blob_count: i64,
    client_accepts_zstd: bool,
) -> (bool, bool) {
    let (mut stream_compress, pre_compress) = if cdn.auto_stream_compress_ratio > 0.0 && distinct_blob_count > 0 {
        let ratio = requested_count as f64 / distinct_blob_count as f64;
        if ratio > cdn.auto_stream_compress_ratio {
            (true, false)
        } else {
            (false, true)
        }
    } else {
        (cdn.stream_compress, cdn.send_pre_compressed)
    };

    if !client_accepts_zstd {
        stream_compress = false;
    }
    (stream_compress, pre_compress)
}

/// Writes the stream header plus one `FileRecord` per requested index, in
/// the order given, into `out`. Returns bytes written (pre-outer-compression).
pub fn write_stream(
    out: &mut impl Write,
    content: &ContentStore,
    version_id: i64,
    indices: &[i32],
    pre_compress: bool,
) -> Result<(), DownloadError> {
    let flags: u32 = if pre_compress { PRE_COMPRESSED_FLAG } else { 0 };
    out.write_all(&flags.to_le_bytes())?;

    for &index in indices {
        let row = content
            .content_at_index(version_id, i64::from(index))?
            .ok_or(DownloadError::IndexOutOfBounds {
                index,
                entries: 0,
            })?;

        if pre_compress {
            write_file_record_pre_compressed(out, &row)?;
        } else {
            write_file_record_stream_decompressed(out, &row)?;
        }
    }
    Ok(())
}

fn write_file_record_pre_compressed(
    out: &mut impl Write,
    row: &crate::db::content::ContentRow,
) -> Result<(), DownloadError> {
    out.write_all(&(row.size as u32).to_le_bytes())?;
    match row.compression {
        Compression::ZStd => {
            out.write_all(&(row.payload.len() as u32).to_le_bytes())?;
            out.write_all(&row.payload)?;
        }
        Compression::None => {
            out.write_all(&0u32.to_le_bytes())?;
            out.write_all(&row.payload)?;
        }
    }
    Ok(())
}

fn write_file_record_stream_decompressed(
    out: &mut impl Write,
    row: &crate::db::content::ContentRow,
) -> Result<(), DownloadError> {
    out.write_all(&(row.size as u32).to_le_bytes())?;
    match row.compression {
        Compression::ZStd => {
            let decompressed = codec::zstd_decompress(&row.payload, row.size as usize)?;
            out.write_all(&decompressed)?;
        }
        Compression::None => {
            out.write_all(&row.payload)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn rejects_oversized_body() {
        let body = vec![0u8; MAX_REQUEST_BODY_BYTES + 4];
        assert!(matches!(parse_indices(&body, 10), Err(DownloadError::BodyTooLarge(_))));
    }

    #[test]
    fn rejects_unaligned_body() {
        let body = vec![0u8; 5];
        assert!(matches!(parse_indices(&body, 10), Err(DownloadError::BodyNotAligned(_))));
    }

    #[test]
    fn rejects_out_of_bounds_index() {
        let body = 10i32.to_le_bytes().to_vec();
        assert!(matches!(
            parse_indices(&body, 10),
            Err(DownloadError::IndexOutOfBounds { index: 10, entries: 10 })
        ));

        let body = (-1i32).to_le_bytes().to_vec();
        assert!(matches!(
            parse_indices(&body, 10),
            Err(DownloadError::IndexOutOfBounds { index: -1, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_index() {
        let mut body = 1i32.to_le_bytes().to_vec();
        body.extend(1i32.to_le_bytes());
        assert!(matches!(parse_indices(&body, 10), Err(DownloadError::DuplicateIndex(1))));
    }

    #[test]
    fn accepts_valid_distinct_indices() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend(1i32.to_le_bytes());
        assert_eq!(parse_indices(&body, 10).unwrap(), vec![0, 1]);
    }

    #[test]
    fn auto_select_picks_stream_compress_above_ratio() {
        let mut cdn = sample_cdn();
        cdn.auto_stream_compress_ratio = 0.5;
        let (stream, pre) = resolve_compression_strategy(&cdn, 6, 10, true);
        assert!(stream);
        assert!(!pre);
    }

    #[test]
    fn auto_select_picks_pre_compress_below_ratio() {
        let mut cdn = sample_cdn();
        cdn.auto_stream_compress_ratio = 0.5;
        let (stream, pre) = resolve_compression_strategy(&cdn, 2, 10, true);
        assert!(!stream);
        assert!(pre);
    }

    #[test]
    fn disabled_ratio_uses_configured_flags() {
        let mut cdn = sample_cdn();
        cdn.auto_stream_compress_ratio = 0.0;
        cdn.stream_compress = true;
        cdn.send_pre_compressed = false;
        let (stream, pre) = resolve_compression_strategy(&cdn, 9999, 1, true);
        assert!(stream);
        assert!(!pre);
    }

    #[test]
    fn stream_compress_requires_client_accept() {
        let mut cdn = sample_cdn();
        cdn.stream_compress = true;
        let (stream, _) = resolve_compression_strategy(&cdn, 1, 1, false);
        assert!(!stream);
    }

    #[test]
    fn scenario_one_plain_uncompressed_download() {
        let content = ContentStore::open(Path::new(":memory:"), 1).unwrap();
        let version_id = content.begin_content_version("wow", "1.0.0", "2026-01-01T00:00:00Z").unwrap();
        let hash_a = crate::hashing::ObjectHash::hash(b"hello");
        let hash_b = crate::hashing::ObjectHash::hash(b"world");
        let id_a = content.insert_content(&hash_a, 5, Compression::None, b"hello").unwrap();
        let id_b = content.insert_content(&hash_b, 5, Compression::None, b"world").unwrap();
        content.insert_manifest_entry(version_id, 0, id_a).unwrap();
        content.insert_manifest_entry(version_id, 1, id_b).unwrap();

        let mut out = Vec::new();
        write_stream(&mut out, &content, version_id, &[1], false).unwrap();

        assert_eq!(&out[0..4], &[0, 0, 0, 0]);
        assert_eq!(&out[4..8], &5u32.to_le_bytes());
        assert_eq!(&out[8..], b"world");
    }

    fn sample_cdn() -> CdnSettings {
        CdnSettings {
            database_file_name: "content.db".into(),
            version_disk_path: "/tmp".into(),
            blob_compress: true,
            blob_compress_level: 3,
            blob_compress_savings_threshold: 8,
            manifest_compress_level: 3,
            stream_compress: false,
            stream_compress_level: 3,
            send_pre_compressed: false,
            auto_stream_compress_ratio: 0.0,
            log_requests: false,
            log_request_storage: crate::config::RequestLogStorage::None,
        }
    }
}
