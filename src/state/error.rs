//! Error types for the metadata store.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorClass;

/// Errors that can occur during metadata store operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Another engine holds the store.
    #[error("State directory is locked by another stormcloud instance (lock: {0})")]
    Locked(PathBuf),

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// A version operation referenced a version in the wrong state.
    #[error("Version {version} of file {file_id} is not pending")]
    NotPending { file_id: String, version: u64 },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Io
    }
}
