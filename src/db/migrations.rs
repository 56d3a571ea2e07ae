//! Ordered, named SQL migrations applied once per database.
//!
//! Each script runs inside its own `SAVEPOINT`; a failure rolls back just
//! that script and stops the migration run, per spec.md's migration
//! propagation policy. Applied script names are recorded in
//! `SchemaVersions` so a restart only runs what's new.

use rusqlite::Connection;

use crate::error::DbError;

/// A single named migration script.
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Applies every migration in `migrations` not already recorded in
/// `SchemaVersions`, in order.
pub fn apply_all(conn: &mut Connection, migrations: &[Migration]) -> Result<(), DbError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS SchemaVersions (
            ScriptName TEXT NOT NULL PRIMARY KEY,
            Applied TEXT NOT NULL
        )",
        (),
    )?;

    for migration in migrations {
        let already_applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM SchemaVersions WHERE ScriptName = ?1)",
            [migration.name],
            |row| row.get(0),
        )?;
        if already_applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&format!("SAVEPOINT migration; {} RELEASE migration;", migration.sql))
            .map_err(|source| DbError::Migration {
                script: migration.name,
                source,
            })?;
        tx.execute(
            "INSERT INTO SchemaVersions (ScriptName, Applied) VALUES (?1, ?2)",
            (migration.name, chrono::Utc::now().to_rfc3339()),
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_each_migration_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = [
            Migration {
                name: "001_create_widgets",
                sql: "CREATE TABLE Widgets (id INTEGER PRIMARY KEY);",
            },
            Migration {
                name: "002_add_name",
                sql: "ALTER TABLE Widgets ADD COLUMN name TEXT;",
            },
        ];
        apply_all(&mut conn, &migrations).unwrap();
        apply_all(&mut conn, &migrations).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM SchemaVersions", (), |r| r.get(0))
            .unwrap();
        assert_eq!(applied, 2);

        conn.execute("INSERT INTO Widgets (name) VALUES ('ok')", ())
            .unwrap();
    }

    #[test]
    fn failing_migration_is_not_recorded() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = [Migration {
            name: "bad",
            sql: "CREATE TABLE 1invalid (id INTEGER);",
        }];
        assert!(apply_all(&mut conn, &migrations).is_err());
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM SchemaVersions", (), |r| r.get(0))
            .unwrap();
        assert_eq!(applied, 0);
    }
}
