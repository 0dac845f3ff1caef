use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorClass;
use crate::state::StateError;
use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("No tracked file matches {0}")]
    UnknownFile(String),

    #[error("Version {version} of {file} does not exist")]
    VersionNotFound { file: String, version: u64 },

    #[error("Version {version} of {file} is not committed yet")]
    NotCommitted { file: String, version: u64 },

    #[error("Version {version} of {file} records a deletion and has no content")]
    Tombstone { file: String, version: u64 },

    #[error("Chunk {0} failed verification after re-download")]
    Corruption(String),

    #[error("Restored content of {0} does not match the version fingerprint")]
    ContentMismatch(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("The engine stopped before the restore finished")]
    Stopped,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl RestoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Corruption(_) | Self::ContentMismatch(_) => ErrorClass::Corruption,
            Self::Transfer(e) => e.class(),
            Self::UnknownFile(_)
            | Self::VersionNotFound { .. }
            | Self::NotCommitted { .. }
            | Self::Tombstone { .. }
            | Self::Io { .. }
            | Self::Stopped
            | Self::State(_) => ErrorClass::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(
            RestoreError::Corruption("ab".into()).class(),
            ErrorClass::Corruption
        );
        assert_eq!(
            RestoreError::Transfer(TransferError::Auth("no".into())).class(),
            ErrorClass::Auth
        );
        assert_eq!(
            RestoreError::Tombstone {
                file: "a".into(),
                version: 2
            }
            .class(),
            ErrorClass::Io
        );
    }
}
