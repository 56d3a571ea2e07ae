//! The content store: `Content` blobs, per-version manifest entries, and the
//! optional request log.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{OptionalExtension, params};

use crate::codec::{self, Compression, CompressBuffer};
use crate::db::migrations::{self, Migration};
use crate::db::pool::ConnectionPool;
use crate::error::DbError;
use crate::hashing::{ObjectHash, canonical_manifest_text};

const MIGRATIONS: &[Migration] = &[Migration {
    name: "001_content_store_init",
    sql: "
        CREATE TABLE Content (
            Id INTEGER PRIMARY KEY,
            Hash BLOB NOT NULL UNIQUE,
            Size INTEGER NOT NULL,
            Compression TEXT NOT NULL CHECK(Compression IN ('none','zstd')),
            Payload BLOB NOT NULL
        );

        CREATE TABLE ContentVersion (
            Id INTEGER PRIMARY KEY,
            Fork TEXT NOT NULL,
            VersionName TEXT NOT NULL,
            PublishTime TEXT NOT NULL,
            ManifestHash BLOB NOT NULL,
            ManifestData BLOB NOT NULL,
            ManifestUncompressedLen INTEGER NOT NULL,
            CountDistinctBlobs INTEGER NOT NULL,
            UNIQUE(Fork, VersionName)
        );

        CREATE TABLE ContentManifestEntry (
            VersionId INTEGER NOT NULL REFERENCES ContentVersion(Id),
            ManifestIdx INTEGER NOT NULL,
            ContentId INTEGER NOT NULL REFERENCES Content(Id) ON DELETE RESTRICT,
            PRIMARY KEY (VersionId, ManifestIdx)
        ) WITHOUT ROWID;

        CREATE TABLE RequestLogBlob (
            Id INTEGER PRIMARY KEY,
            Hash BLOB NOT NULL UNIQUE,
            Data BLOB NOT NULL
        );

        CREATE TABLE RequestLog (
            Id INTEGER PRIMARY KEY,
            Time TEXT NOT NULL,
            Flags INTEGER NOT NULL,
            Protocol INTEGER NOT NULL,
            BytesSent INTEGER NOT NULL,
            VersionId INTEGER NOT NULL REFERENCES ContentVersion(Id),
            BodyBlobId INTEGER REFERENCES RequestLogBlob(Id)
        );
    ",
}];

/// One manifest entry awaiting ingestion: its content hash, its path inside
/// the version's client archive, and the raw bytes read from that archive.
pub struct PendingEntry {
    pub hash: ObjectHash,
    pub name: String,
    pub data: Vec<u8>,
}

/// A fully materialized blob record (payload included).
pub struct ContentRow {
    pub id: i64,
    pub hash: ObjectHash,
    pub size: i64,
    pub compression: Compression,
    pub payload: Vec<u8>,
}

pub struct ContentStore {
    pool: ConnectionPool,
}

impl ContentStore {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, DbError> {
        let pool = ConnectionPool::open(path, pool_size)?;
        {
            let mut conn = pool.get();
            migrations::apply_all(&mut conn, MIGRATIONS)?;
        }
        Ok(Self { pool })
    }

    /// Atomically ingests one version: inserts its `ContentVersion` row,
    /// dedup-inserts (or reuses) each entry's blob, records every
    /// `ContentManifestEntry`, and finalizes the version with its canonical
    /// manifest hash/data — all inside one transaction. A failure partway
    /// rolls back the whole version, so `has_version` never reports a
    /// half-ingested version and the next scan retries it from scratch.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest_version(
        &self,
        fork: &str,
        version: &str,
        publish_time: &str,
        blob_compress: bool,
        blob_compress_level: i32,
        blob_compress_savings_threshold: usize,
        manifest_compress_level: i32,
        entries: &[PendingEntry],
    ) -> Result<i64, DbError> {
        let mut conn = self.pool.get();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO ContentVersion (Fork, VersionName, PublishTime, ManifestHash, ManifestData, ManifestUncompressedLen, CountDistinctBlobs)
             VALUES (?1, ?2, ?3, X'', X'', 0, 0)",
            params![fork, version, publish_time],
        )?;
        let version_id = tx.last_insert_rowid();

        let mut buf = CompressBuffer::new();
        let mut manifest_entries = Vec::with_capacity(entries.len());
        let mut distinct_blobs = HashSet::with_capacity(entries.len());

        for (idx, entry) in entries.iter().enumerate() {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT Id FROM Content WHERE Hash = ?1",
                    params![entry.hash.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;

            let content_id = match existing {
                Some(id) => id,
                None => {
                    let (compression, payload) = codec::compress_if_worthwhile(
                        &entry.data,
                        blob_compress,
                        blob_compress_level,
                        blob_compress_savings_threshold,
                        &mut buf,
                    )?;
                    tx.execute(
                        "INSERT INTO Content (Hash, Size, Compression, Payload) VALUES (?1, ?2, ?3, ?4)",
                        params![entry.hash.as_bytes().as_slice(), entry.data.len() as i64, compression.as_str(), payload],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            tx.execute(
                "INSERT INTO ContentManifestEntry (VersionId, ManifestIdx, ContentId) VALUES (?1, ?2, ?3)",
                params![version_id, idx as i64, content_id],
            )?;
            distinct_blobs.insert(content_id);
            manifest_entries.push((entry.hash, entry.name.clone()));
        }

        let manifest_text = canonical_manifest_text(&manifest_entries);
        let manifest_hash = ObjectHash::hash(manifest_text.as_bytes());
        let manifest_compressed = codec::zstd_compress(manifest_text.as_bytes(), manifest_compress_level, &mut buf)?;

        tx.execute(
            "UPDATE ContentVersion SET ManifestHash = ?2, ManifestData = ?3, ManifestUncompressedLen = ?4, CountDistinctBlobs = ?5 WHERE Id = ?1",
            params![
                version_id,
                manifest_hash.as_bytes().as_slice(),
                manifest_compressed,
                manifest_text.len() as i64,
                distinct_blobs.len() as i64
            ],
        )?;

        tx.commit()?;
        Ok(version_id)
    }

    /// Checkpoints the WAL back into the main database file. Called
    /// periodically during a long ingestion run to cap WAL growth, since each
    /// version's own transaction otherwise only commits into the WAL.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    /// Looks up a blob's id by content hash, without fetching its payload.
    pub fn find_content_id(&self, hash: &ObjectHash) -> Result<Option<i64>, DbError> {
        let conn = self.pool.get();
        let id = conn
            .query_row(
                "SELECT Id FROM Content WHERE Hash = ?1",
                params![hash.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Inserts a new blob, returning its id. Caller must have already checked
    /// `find_content_id` to avoid duplicate-hash inserts racing.
    pub fn insert_content(
        &self,
        hash: &ObjectHash,
        size: i64,
        compression: Compression,
        payload: &[u8],
    ) -> Result<i64, DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO Content (Hash, Size, Compression, Payload) VALUES (?1, ?2, ?3, ?4)",
            params![hash.as_bytes().as_slice(), size, compression.as_str(), payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_content(&self, id: i64) -> Result<Option<ContentRow>, DbError> {
        let conn = self.pool.get();
        let row = conn
            .query_row(
                "SELECT Id, Hash, Size, Compression, Payload FROM Content WHERE Id = ?1",
                params![id],
                |row| {
                    let hash: Vec<u8> = row.get(1)?;
                    let compression: String = row.get(3)?;
                    Ok((row.get::<_, i64>(0)?, hash, row.get::<_, i64>(2)?, compression, row.get::<_, Vec<u8>>(4)?))
                },
            )
            .optional()?;
        Ok(row.map(|(id, hash, size, compression, payload)| {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&hash);
            ContentRow {
                id,
                hash: ObjectHash::from(buf),
                size,
                compression: Compression::parse(&compression).unwrap_or(Compression::None),
                payload,
            }
        }))
    }

    /// Starts a new `ContentVersion` row with placeholder manifest data,
    /// returning its id.
    pub fn begin_content_version(&self, fork: &str, version: &str, publish_time: &str) -> Result<i64, DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO ContentVersion (Fork, VersionName, PublishTime, ManifestHash, ManifestData, ManifestUncompressedLen, CountDistinctBlobs)
             VALUES (?1, ?2, ?3, X'', X'', 0, 0)",
            params![fork, version, publish_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_manifest_entry(&self, version_id: i64, manifest_idx: i64, content_id: i64) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO ContentManifestEntry (VersionId, ManifestIdx, ContentId) VALUES (?1, ?2, ?3)",
            params![version_id, manifest_idx, content_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish_content_version(
        &self,
        version_id: i64,
        manifest_hash: &ObjectHash,
        manifest_data: &[u8],
        manifest_uncompressed_len: i64,
        count_distinct_blobs: i64,
    ) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "UPDATE ContentVersion SET ManifestHash = ?2, ManifestData = ?3, ManifestUncompressedLen = ?4, CountDistinctBlobs = ?5 WHERE Id = ?1",
            params![
                version_id,
                manifest_hash.as_bytes().as_slice(),
                manifest_data,
                manifest_uncompressed_len,
                count_distinct_blobs
            ],
        )?;
        Ok(())
    }

    /// Whether `(fork, version)` has already been ingested.
    pub fn has_version(&self, fork: &str, version: &str) -> Result<bool, DbError> {
        let conn = self.pool.get();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM ContentVersion WHERE Fork = ?1 AND VersionName = ?2)",
            params![fork, version],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn find_version_id(&self, fork: &str, version: &str) -> Result<Option<i64>, DbError> {
        let conn = self.pool.get();
        let id = conn
            .query_row(
                "SELECT Id FROM ContentVersion WHERE Fork = ?1 AND VersionName = ?2",
                params![fork, version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Returns `(hash, compressed manifest bytes, uncompressed length)`.
    pub fn manifest_data(&self, version_id: i64) -> Result<Option<(ObjectHash, Vec<u8>, i64)>, DbError> {
        let conn = self.pool.get();
        let row = conn
            .query_row(
                "SELECT ManifestHash, ManifestData, ManifestUncompressedLen FROM ContentVersion WHERE Id = ?1",
                params![version_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(hash, data, len)| {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&hash);
            (ObjectHash::from(buf), data, len)
        }))
    }

    pub fn entries_count(&self, version_id: i64) -> Result<i64, DbError> {
        let conn = self.pool.get();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ContentManifestEntry WHERE VersionId = ?1",
            params![version_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn distinct_blob_count(&self, version_id: i64) -> Result<i64, DbError> {
        let conn = self.pool.get();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT ContentId) FROM ContentManifestEntry WHERE VersionId = ?1",
            params![version_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Fetches the blob behind manifest index `idx` of `version_id`.
    pub fn content_at_index(&self, version_id: i64, idx: i64) -> Result<Option<ContentRow>, DbError> {
        let conn = self.pool.get();
        let id: Option<i64> = conn
            .query_row(
                "SELECT ContentId FROM ContentManifestEntry WHERE VersionId = ?1 AND ManifestIdx = ?2",
                params![version_id, idx],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match id {
            Some(id) => self.get_content(id),
            None => Ok(None),
        }
    }

    pub fn insert_request_log_blob(&self, hash: &ObjectHash, data: &[u8]) -> Result<i64, DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO RequestLogBlob (Hash, Data) VALUES (?1, ?2)
             ON CONFLICT(Hash) DO NOTHING",
            params![hash.as_bytes().as_slice(), data],
        )?;
        let id: i64 = conn.query_row(
            "SELECT Id FROM RequestLogBlob WHERE Hash = ?1",
            params![hash.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_request_log(
        &self,
        time: &str,
        flags: i64,
        protocol: i64,
        bytes_sent: i64,
        version_id: i64,
        body_blob_id: Option<i64>,
    ) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO RequestLog (Time, Flags, Protocol, BytesSent, VersionId, BodyBlobId)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![time, flags, protocol, bytes_sent, version_id, body_blob_id],
        )?;
        Ok(())
    }

    /// Total number of ingested content versions, across all forks.
    pub fn version_count(&self) -> Result<i64, DbError> {
        let conn = self.pool.get();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ContentVersion", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Lists recently ingested `(fork, version)` pairs; used by the
    /// availability job to find versions to flip.
    pub fn recently_ingested(&self, since_id: i64) -> Result<Vec<(i64, String, String)>, DbError> {
        let conn = self.pool.get();
        let mut stmt = conn.prepare(
            "SELECT Id, Fork, VersionName FROM ContentVersion WHERE Id > ?1 ORDER BY Id ASC",
        )?;
        let rows = stmt
            .query_map(params![since_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;

    fn store() -> ContentStore {
        ContentStore::open(Path::new(":memory:"), 1).unwrap()
    }

    #[test]
    fn dedups_content_by_hash() {
        let store = store();
        let hash = ObjectHash::hash(b"x");
        assert!(store.find_content_id(&hash).unwrap().is_none());
        let id = store.insert_content(&hash, 1, Compression::None, b"x").unwrap();
        assert_eq!(store.find_content_id(&hash).unwrap(), Some(id));
    }

    #[test]
    fn version_round_trip() {
        let store = store();
        let version_id = store.begin_content_version("wow", "1.0.0", "2026-01-01T00:00:00Z").unwrap();
        assert!(store.has_version("wow", "1.0.0").unwrap());

        let hash_a = ObjectHash::hash(b"hello");
        let content_a = store.insert_content(&hash_a, 5, Compression::None, b"hello").unwrap();
        store.insert_manifest_entry(version_id, 0, content_a).unwrap();

        let manifest_hash = ObjectHash::hash(b"manifest");
        store
            .finish_content_version(version_id, &manifest_hash, b"manifest bytes", 14, 1)
            .unwrap();

        assert_eq!(store.entries_count(version_id).unwrap(), 1);
        assert_eq!(store.distinct_blob_count(version_id).unwrap(), 1);

        let (hash, data, len) = store.manifest_data(version_id).unwrap().unwrap();
        assert_eq!(hash, manifest_hash);
        assert_eq!(data, b"manifest bytes");
        assert_eq!(len, 14);

        let row = store.content_at_index(version_id, 0).unwrap().unwrap();
        assert_eq!(row.payload, b"hello");
    }

    #[test]
    fn ingest_version_dedups_across_versions_atomically() {
        let store = store();
        let entries_a = vec![
            PendingEntry { hash: ObjectHash::hash(b"hello"), name: "a.txt".to_string(), data: b"hello".to_vec() },
            PendingEntry { hash: ObjectHash::hash(b"world"), name: "b.txt".to_string(), data: b"world".to_vec() },
        ];
        let version_a = store
            .ingest_version("wow", "1.0.0", "2026-01-01T00:00:00Z", true, 3, 8, 3, &entries_a)
            .unwrap();
        assert!(store.has_version("wow", "1.0.0").unwrap());
        assert_eq!(store.entries_count(version_a).unwrap(), 2);
        assert_eq!(store.distinct_blob_count(version_a).unwrap(), 2);

        let entries_b = vec![PendingEntry {
            hash: ObjectHash::hash(b"hello"),
            name: "a.txt".to_string(),
            data: b"hello".to_vec(),
        }];
        let version_b = store
            .ingest_version("wow", "2.0.0", "2026-01-02T00:00:00Z", true, 3, 8, 3, &entries_b)
            .unwrap();
        assert_eq!(store.distinct_blob_count(version_b).unwrap(), 1);

        let row_a = store.content_at_index(version_a, 0).unwrap().unwrap();
        let row_b = store.content_at_index(version_b, 0).unwrap().unwrap();
        assert_eq!(row_a.id, row_b.id, "identical content across versions must dedup to the same blob");

        let (manifest_hash, _data, _len) = store.manifest_data(version_a).unwrap().unwrap();
        assert_ne!(manifest_hash.as_bytes(), &[0u8; 32], "finalized version must have a real manifest hash");
    }

    #[test]
    fn request_log_blob_dedups() {
        let store = store();
        let version_id = store.begin_content_version("wow", "1.0.0", "2026-01-01T00:00:00Z").unwrap();
        let hash = ObjectHash::hash(b"body");
        let blob_id_a = store.insert_request_log_blob(&hash, b"body").unwrap();
        let blob_id_b = store.insert_request_log_blob(&hash, b"body").unwrap();
        assert_eq!(blob_id_a, blob_id_b);
        store
            .insert_request_log("2026-01-01T00:00:00Z", 0, 1, 4, version_id, Some(blob_id_a))
            .unwrap();
    }
}
