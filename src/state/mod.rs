//! Metadata store: the durable record of tracked files and their versions.
//!
//! This module provides SQLite-based persistence for the backup engine:
//! - Tracked file identity, path mapping and sync status
//! - Version history with chunk manifests (pending until the backend commits)
//! - Chunks acknowledged by the backend, so interrupted uploads resume
//! - Garbage-collection queue for chunks no version references
//! - Sync run history for status reporting

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{MetadataStore, SqliteMetadataStore};
pub use error::StateError;
pub use types::{
    ChunkRef, FileId, FileIdentity, FileVersion, Fingerprint, RunSource, SyncRunRecord,
    SyncRunStats, SyncStatus, SyncSummary, TrackedFile, VersionState,
};
