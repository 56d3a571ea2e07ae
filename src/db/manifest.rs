//! The manifest store: forks, versions, server builds, and in-progress
//! multi-request publishes.

use std::path::Path;

use rusqlite::{OptionalExtension, params};

use crate::db::migrations::{self, Migration};
use crate::db::pool::ConnectionPool;
use crate::error::DbError;

const MIGRATIONS: &[Migration] = &[Migration {
    name: "001_manifest_store_init",
    sql: "
        CREATE TABLE Fork (
            Name TEXT PRIMARY KEY,
            UpdateToken TEXT NOT NULL,
            ClientZipName TEXT NOT NULL,
            ServerZipName TEXT NOT NULL,
            Private INTEGER NOT NULL DEFAULT 0,
            PrivateUsersJson TEXT,
            NotifyWatchdogsJson TEXT,
            PruneBuildsDays INTEGER,
            ServerManifestCache BLOB
        );

        CREATE TABLE ForkVersion (
            Id INTEGER PRIMARY KEY,
            Fork TEXT NOT NULL REFERENCES Fork(Name) ON DELETE CASCADE,
            Name TEXT NOT NULL,
            PublishTime TEXT NOT NULL,
            EngineVersion TEXT NOT NULL,
            ClientZipName TEXT NOT NULL,
            ClientZipSha256 TEXT NOT NULL,
            Available INTEGER NOT NULL DEFAULT 0,
            UNIQUE(Fork, Name)
        );

        CREATE TABLE ForkVersionServerBuild (
            Id INTEGER PRIMARY KEY,
            VersionId INTEGER NOT NULL REFERENCES ForkVersion(Id) ON DELETE CASCADE,
            Platform TEXT NOT NULL,
            FileName TEXT NOT NULL,
            Sha256 TEXT NOT NULL,
            Size INTEGER,
            UNIQUE(VersionId, Platform),
            UNIQUE(VersionId, FileName)
        );

        CREATE TABLE PublishInProgress (
            Id INTEGER PRIMARY KEY,
            Fork TEXT NOT NULL,
            VersionName TEXT NOT NULL,
            StartTime TEXT NOT NULL,
            EngineVersion TEXT NOT NULL,
            UNIQUE(Fork, VersionName)
        );
    ",
}];

pub struct ForkRow {
    pub name: String,
    pub update_token: String,
    pub client_zip_name: String,
    pub server_zip_name: String,
    pub private: bool,
    pub private_users_json: Option<String>,
    pub notify_watchdogs_json: Option<String>,
    pub prune_builds_days: Option<i64>,
}

pub struct ForkVersionRow {
    pub id: i64,
    pub fork: String,
    pub name: String,
    pub publish_time: String,
    pub engine_version: String,
    pub client_zip_name: String,
    pub client_zip_sha256: String,
    pub available: bool,
}

pub struct ServerBuildRow {
    pub platform: String,
    pub file_name: String,
    pub sha256: String,
    pub size: Option<i64>,
}

pub struct ManifestStore {
    pool: ConnectionPool,
}

impl ManifestStore {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, DbError> {
        let pool = ConnectionPool::open(path, pool_size)?;
        {
            let mut conn = pool.get();
            migrations::apply_all(&mut conn, MIGRATIONS)?;
        }
        Ok(Self { pool })
    }

    /// Idempotently upserts a fork's configuration-driven row at startup.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_fork(
        &self,
        name: &str,
        update_token: &str,
        client_zip_name: &str,
        server_zip_name: &str,
        private: bool,
        private_users_json: &str,
        notify_watchdogs_json: &str,
        prune_builds_days: Option<i64>,
    ) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO Fork (Name, UpdateToken, ClientZipName, ServerZipName, Private, PrivateUsersJson, NotifyWatchdogsJson, PruneBuildsDays)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(Name) DO UPDATE SET
                UpdateToken = excluded.UpdateToken,
                ClientZipName = excluded.ClientZipName,
                ServerZipName = excluded.ServerZipName,
                Private = excluded.Private,
                PrivateUsersJson = excluded.PrivateUsersJson,
                NotifyWatchdogsJson = excluded.NotifyWatchdogsJson,
                PruneBuildsDays = excluded.PruneBuildsDays",
            params![
                name,
                update_token,
                client_zip_name,
                server_zip_name,
                private as i64,
                private_users_json,
                notify_watchdogs_json,
                prune_builds_days
            ],
        )?;
        Ok(())
    }

    pub fn get_fork(&self, name: &str) -> Result<Option<ForkRow>, DbError> {
        let conn = self.pool.get();
        let row = conn
            .query_row(
                "SELECT Name, UpdateToken, ClientZipName, ServerZipName, Private, PrivateUsersJson, NotifyWatchdogsJson, PruneBuildsDays
                 FROM Fork WHERE Name = ?1",
                params![name],
                |row| {
                    Ok(ForkRow {
                        name: row.get(0)?,
                        update_token: row.get(1)?,
                        client_zip_name: row.get(2)?,
                        server_zip_name: row.get(3)?,
                        private: row.get::<_, i64>(4)? != 0,
                        private_users_json: row.get(5)?,
                        notify_watchdogs_json: row.get(6)?,
                        prune_builds_days: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_server_manifest_cache(&self, fork: &str, data: &[u8]) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "UPDATE Fork SET ServerManifestCache = ?2 WHERE Name = ?1",
            params![fork, data],
        )?;
        Ok(())
    }

    pub fn get_server_manifest_cache(&self, fork: &str) -> Result<Option<Vec<u8>>, DbError> {
        let conn = self.pool.get();
        let data = conn
            .query_row(
                "SELECT ServerManifestCache FROM Fork WHERE Name = ?1",
                params![fork],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data.flatten())
    }

    /// Inserts the `ForkVersion` row and its server builds; called at the end
    /// of publish finalization.
    pub fn insert_fork_version(
        &self,
        fork: &str,
        name: &str,
        publish_time: &str,
        engine_version: &str,
        client_zip_name: &str,
        client_zip_sha256: &str,
        server_builds: &[ServerBuildRow],
    ) -> Result<i64, DbError> {
        let mut conn = self.pool.get();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO ForkVersion (Fork, Name, PublishTime, EngineVersion, ClientZipName, ClientZipSha256, Available)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![fork, name, publish_time, engine_version, client_zip_name, client_zip_sha256],
        )?;
        let version_id = tx.last_insert_rowid();
        for build in server_builds {
            tx.execute(
                "INSERT INTO ForkVersionServerBuild (VersionId, Platform, FileName, Sha256, Size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![version_id, build.platform, build.file_name, build.sha256, build.size],
            )?;
        }
        tx.commit()?;
        Ok(version_id)
    }

    pub fn version_exists(&self, fork: &str, name: &str) -> Result<bool, DbError> {
        let conn = self.pool.get();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM ForkVersion WHERE Fork = ?1 AND Name = ?2)",
            params![fork, name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn set_available(&self, fork: &str, name: &str, available: bool) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "UPDATE ForkVersion SET Available = ?3 WHERE Fork = ?1 AND Name = ?2",
            params![fork, name, available as i64],
        )?;
        Ok(())
    }

    /// Available versions for a fork, most recent first, capped at `limit`.
    pub fn available_versions(&self, fork: &str, limit: i64) -> Result<Vec<ForkVersionRow>, DbError> {
        let conn = self.pool.get();
        let mut stmt = conn.prepare(
            "SELECT Id, Fork, Name, PublishTime, EngineVersion, ClientZipName, ClientZipSha256, Available
             FROM ForkVersion WHERE Fork = ?1 AND Available = 1
             ORDER BY PublishTime DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fork, limit], Self::map_fork_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_fork_version(&self, fork: &str, name: &str) -> Result<Option<ForkVersionRow>, DbError> {
        let conn = self.pool.get();
        let row = conn
            .query_row(
                "SELECT Id, Fork, Name, PublishTime, EngineVersion, ClientZipName, ClientZipSha256, Available
                 FROM ForkVersion WHERE Fork = ?1 AND Name = ?2",
                params![fork, name],
                Self::map_fork_version,
            )
            .optional()?;
        Ok(row)
    }

    pub fn server_builds(&self, version_id: i64) -> Result<Vec<ServerBuildRow>, DbError> {
        let conn = self.pool.get();
        let mut stmt = conn.prepare(
            "SELECT Platform, FileName, Sha256, Size FROM ForkVersionServerBuild WHERE VersionId = ?1",
        )?;
        let rows = stmt
            .query_map(params![version_id], |row| {
                Ok(ServerBuildRow {
                    platform: row.get(0)?,
                    file_name: row.get(1)?,
                    sha256: row.get(2)?,
                    size: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Begins (or aborts and restarts) a multi-request publish.
    ///
    /// Returns `true` if a prior in-progress publish for `(fork, version)`
    /// existed and was aborted.
    pub fn start_publish(&self, fork: &str, version: &str, engine_version: &str, start_time: &str) -> Result<bool, DbError> {
        let mut conn = self.pool.get();
        let tx = conn.transaction()?;
        let existed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM PublishInProgress WHERE Fork = ?1 AND VersionName = ?2)",
            params![fork, version],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM PublishInProgress WHERE Fork = ?1 AND VersionName = ?2",
            params![fork, version],
        )?;
        tx.execute(
            "INSERT INTO PublishInProgress (Fork, VersionName, StartTime, EngineVersion) VALUES (?1, ?2, ?3, ?4)",
            params![fork, version, start_time, engine_version],
        )?;
        tx.commit()?;
        Ok(existed)
    }

    pub fn finish_publish(&self, fork: &str, version: &str) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute(
            "DELETE FROM PublishInProgress WHERE Fork = ?1 AND VersionName = ?2",
            params![fork, version],
        )?;
        Ok(())
    }

    /// The `EngineVersion` recorded at `/start`, looked up again by
    /// `/finish` so clients don't have to resend it.
    pub fn in_progress_engine_version(&self, fork: &str, version: &str) -> Result<Option<String>, DbError> {
        let conn = self.pool.get();
        let engine_version = conn
            .query_row(
                "SELECT EngineVersion FROM PublishInProgress WHERE Fork = ?1 AND VersionName = ?2",
                params![fork, version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(engine_version)
    }

    pub fn in_progress_exists(&self, fork: &str, version: &str) -> Result<bool, DbError> {
        let conn = self.pool.get();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM PublishInProgress WHERE Fork = ?1 AND VersionName = ?2)",
            params![fork, version],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Publishes whose `StartTime` is older than `cutoff_rfc3339`; returned
    /// for the stale-publish cleanup job to delete alongside their
    /// directories.
    pub fn stale_publishes(&self, cutoff_rfc3339: &str) -> Result<Vec<(String, String)>, DbError> {
        let conn = self.pool.get();
        let mut stmt =
            conn.prepare("SELECT Fork, VersionName FROM PublishInProgress WHERE StartTime < ?1")?;
        let rows = stmt
            .query_map(params![cutoff_rfc3339], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Versions older than their fork's prune threshold; returned for the
    /// prune job to delete.
    pub fn prunable_versions(&self, now_rfc3339: &str) -> Result<Vec<ForkVersionRow>, DbError> {
        let conn = self.pool.get();
        let mut stmt = conn.prepare(
            "SELECT v.Id, v.Fork, v.Name, v.PublishTime, v.EngineVersion, v.ClientZipName, v.ClientZipSha256, v.Available
             FROM ForkVersion v
             JOIN Fork f ON f.Name = v.Fork
             WHERE f.PruneBuildsDays IS NOT NULL
               AND julianday(?1) - julianday(v.PublishTime) > f.PruneBuildsDays",
        )?;
        let rows = stmt
            .query_map(params![now_rfc3339], Self::map_fork_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_version(&self, version_id: i64) -> Result<(), DbError> {
        let conn = self.pool.get();
        conn.execute("DELETE FROM ForkVersion WHERE Id = ?1", params![version_id])?;
        Ok(())
    }

    fn map_fork_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ForkVersionRow> {
        Ok(ForkVersionRow {
            id: row.get(0)?,
            fork: row.get(1)?,
            name: row.get(2)?,
            publish_time: row.get(3)?,
            engine_version: row.get(4)?,
            client_zip_name: row.get(5)?,
            client_zip_sha256: row.get(6)?,
            available: row.get::<_, i64>(7)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ManifestStore {
        ManifestStore::open(Path::new(":memory:"), 1).unwrap()
    }

    #[test]
    fn upsert_fork_is_idempotent() {
        let store = store();
        store.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        store.upsert_fork("wow", "tok2", "client", "server", false, "{}", "[]", None).unwrap();
        let fork = store.get_fork("wow").unwrap().unwrap();
        assert_eq!(fork.update_token, "tok2");
    }

    #[test]
    fn publish_lifecycle() {
        let store = store();
        store.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();

        let existed = store.start_publish("wow", "1.0.0", "200.0.0", "2026-01-01T00:00:00Z").unwrap();
        assert!(!existed);
        assert!(store.in_progress_exists("wow", "1.0.0").unwrap());

        let existed_again = store.start_publish("wow", "1.0.0", "200.0.0", "2026-01-02T00:00:00Z").unwrap();
        assert!(existed_again);

        let builds = vec![ServerBuildRow {
            platform: "linux-x64".into(),
            file_name: "server_linux-x64.zip".into(),
            sha256: "abc".into(),
            size: Some(42),
        }];
        let version_id = store
            .insert_fork_version("wow", "1.0.0", "2026-01-02T00:00:00Z", "200.0.0", "client.zip", "deadbeef", &builds)
            .unwrap();
        store.finish_publish("wow", "1.0.0").unwrap();
        assert!(!store.in_progress_exists("wow", "1.0.0").unwrap());

        assert!(!store.get_fork_version("wow", "1.0.0").unwrap().unwrap().available);
        store.set_available("wow", "1.0.0", true).unwrap();
        let available = store.available_versions("wow", 50).unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, version_id);

        let builds_back = store.server_builds(version_id).unwrap();
        assert_eq!(builds_back.len(), 1);
        assert_eq!(builds_back[0].platform, "linux-x64");
    }

    #[test]
    fn duplicate_publish_rejected() {
        let store = store();
        store.upsert_fork("wow", "tok", "client", "server", false, "{}", "[]", None).unwrap();
        store.start_publish("wow", "1.0.0", "200.0.0", "2026-01-01T00:00:00Z").unwrap();
        store
            .insert_fork_version("wow", "1.0.0", "2026-01-01T00:00:00Z", "200.0.0", "client.zip", "abc", &[])
            .unwrap();
        assert!(store.version_exists("wow", "1.0.0").unwrap());
        let result = store.insert_fork_version("wow", "1.0.0", "2026-01-02T00:00:00Z", "200.0.0", "client.zip", "abc", &[]);
        assert!(result.is_err());
    }
}
