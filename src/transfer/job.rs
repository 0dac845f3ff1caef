use std::path::PathBuf;

use serde::Serialize;

use crate::error::ErrorClass;
use crate::state::{FileId, FileVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Upload missing chunks, then commit the pending version.
    Commit,
    /// Re-upload chunks of an already committed version that the backend
    /// reports missing. No commit.
    Repair,
}

/// A pending version bound to its transfer progress.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub path: PathBuf,
    pub version: FileVersion,
    pub kind: JobKind,
    /// Times this job was interrupted and requeued.
    pub attempts: u32,
}

impl UploadJob {
    pub fn commit(path: PathBuf, version: FileVersion) -> Self {
        Self {
            path,
            version,
            kind: JobKind::Commit,
            attempts: 0,
        }
    }

    pub fn repair(path: PathBuf, version: FileVersion) -> Self {
        Self {
            path,
            version,
            kind: JobKind::Repair,
            attempts: 0,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.version.file_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Committed,
    Repaired,
    /// Stopped at a chunk boundary and requeued.
    Paused,
    /// Source file changed after classification.
    Stale,
    Conflict { server_head: Option<u64> },
    Failed { class: ErrorClass, message: String },
    /// Backend rejected credentials; the job was requeued.
    AuthRejected { message: String },
    Cancelled,
}

impl JobOutcome {
    /// The version was abandoned and the file should be rescanned.
    pub fn needs_rescan(&self) -> bool {
        matches!(self, Self::Stale | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub file_id: FileId,
    pub path: PathBuf,
    pub version: u64,
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub chunks_uploaded: usize,
}
