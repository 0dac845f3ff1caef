//! Conflict resolution.
//!
//! When the backend's chain for a file has moved past ours, the server's
//! head is written next to the local file as a conflict copy, the server's
//! history is adopted as the local committed chain and the file is marked
//! [`SyncStatus::Conflict`]. A rescan of the original path then uploads the
//! local content as the next version on top of the server's head.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::restore::{FileRef, RestoreCoordinator, RestoreError};
use crate::state::{FileId, MetadataStore, SyncStatus, VersionState};
use crate::transfer::Backend;
use crate::versions::VersionManager;

/// `"{stem} (conflict YYYY-mm-dd HHMMSS).{ext}"` in the same directory.
pub(crate) fn conflict_copy_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = at.format("%Y-%m-%d %H%M%S");
    let name = match path.extension() {
        Some(ext) => format!("{stem} (conflict {stamp}).{}", ext.to_string_lossy()),
        None => format!("{stem} (conflict {stamp})"),
    };
    path.with_file_name(name)
}

/// Adopt the server's chain for `file_id` and keep its head as a conflict
/// copy. Returns the copy's path, or `None` when the server's head is a
/// deletion (nothing to keep).
pub(crate) async fn resolve(
    store: &dyn MetadataStore,
    backend: &dyn Backend,
    versions: &VersionManager,
    restorer: &RestoreCoordinator,
    file_id: FileId,
    path: &Path,
) -> Result<Option<PathBuf>, RestoreError> {
    let remote: Vec<_> = backend
        .list_versions(file_id)
        .await?
        .into_iter()
        .map(|r| r.into_version(file_id, VersionState::Committed))
        .collect();
    let head = versions.adopt_remote(file_id, remote).await?;

    let copy = match head {
        Some(head) if !head.tombstone => {
            let copy = conflict_copy_path(path, Utc::now());
            restorer
                .restore(&FileRef::Id(file_id), head.version, Some(copy.clone()))
                .await?;
            tracing::warn!(
                file_id = %file_id,
                path = %path.display(),
                server_version = head.version,
                copy = %copy.display(),
                "Backend has a newer version, kept it as a conflict copy"
            );
            Some(copy)
        }
        _ => None,
    };

    let message = match &copy {
        Some(copy) => format!("server version kept at {}", copy.display()),
        None => "server chain adopted".to_string(),
    };
    store
        .set_status(file_id, SyncStatus::Conflict, Some(&message))
        .await?;
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_conflict_copy_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            conflict_copy_path(Path::new("/data/report.doc"), at),
            PathBuf::from("/data/report (conflict 2024-03-09 140507).doc")
        );
        assert_eq!(
            conflict_copy_path(Path::new("/data/Makefile"), at),
            PathBuf::from("/data/Makefile (conflict 2024-03-09 140507)")
        );
    }
}
