//! Database schema definitions and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY NOT NULL,
    path TEXT NOT NULL UNIQUE,
    device INTEGER,
    inode INTEGER,
    current_version INTEGER,
    current_fingerprint TEXT,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    last_checked_at INTEGER,
    last_event_at INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_files_identity ON files(device, inode);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);

CREATE TABLE IF NOT EXISTS versions (
    file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    tombstone INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'pending',
    PRIMARY KEY (file_id, version)
);

CREATE INDEX IF NOT EXISTS idx_versions_state ON versions(state);

CREATE TABLE IF NOT EXISTS version_chunks (
    file_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    chunk_offset INTEGER NOT NULL,
    chunk_length INTEGER NOT NULL,
    PRIMARY KEY (file_id, version, seq),
    FOREIGN KEY (file_id, version) REFERENCES versions(file_id, version) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_version_chunks_fingerprint ON version_chunks(fingerprint);

CREATE TABLE IF NOT EXISTS chunks (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    acknowledged_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS gc_queue (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    scheduled_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL DEFAULT 'realtime',
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    files_seen INTEGER DEFAULT 0,
    versions_committed INTEGER DEFAULT 0,
    files_failed INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent; safe on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let current_version = get_schema_version(conn)?;
    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let result = migrate(&conn);
        assert!(matches!(
            result,
            Err(StateError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in [
            "files",
            "versions",
            "version_chunks",
            "chunks",
            "gc_queue",
            "sync_runs",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "{table}");
        }
    }

    #[test]
    fn test_version_rows_cascade_with_file() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO files (id, path) VALUES ('f', '/a')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO versions (file_id, version, fingerprint, size_bytes, created_at) VALUES ('f', 1, 'x', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO version_chunks (file_id, version, seq, fingerprint, chunk_offset, chunk_length) VALUES ('f', 1, 0, 'x', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM files WHERE id = 'f'", []).unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM version_chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
