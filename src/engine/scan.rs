//! Reconciliation scan.
//!
//! Runs in two phases so renames made while the engine was down are matched
//! by file identity before their old paths are treated as deletions:
//! every regular file under the roots first, then tracked paths the walk
//! did not see.

use std::collections::HashSet;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::state::{MetadataStore, StateError};
use crate::watcher::PathFilter;

/// Every accepted regular file under the filter's roots, sorted.
pub(crate) fn walk_roots(filter: &PathFilter) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in filter.roots() {
        let mut walk = WalkDir::new(&root.path).follow_links(false);
        if !root.recursive {
            walk = walk.max_depth(1);
        }
        let entries = walk
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_type().is_dir() || filter.descend(entry.path())
            });
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(root = %root.path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && filter.accepts(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Tracked, not deleted paths inside the backup set that `seen` lacks.
pub(crate) async fn unseen_tracked(
    store: &dyn MetadataStore,
    filter: &PathFilter,
    seen: &HashSet<PathBuf>,
) -> Result<Vec<PathBuf>, StateError> {
    let mut missing: Vec<PathBuf> = store
        .all_files()
        .await?
        .into_iter()
        .filter(|f| !f.deleted && !seen.contains(&f.path) && filter.accepts(&f.path))
        .map(|f| f.path)
        .collect();
    missing.sort();
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchRoot;
    use crate::state::{SqliteMetadataStore, TrackedFile};

    fn filter(root: PathBuf, recursive: bool) -> PathFilter {
        PathFilter::new(
            vec![WatchRoot {
                path: root,
                recursive,
            }],
            &["*.tmp".to_string()],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_walk_respects_recursion_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b.tmp"), b"b").unwrap();
        std::fs::write(root.join("sub/c.txt"), b"c").unwrap();

        let all = walk_roots(&filter(root.clone(), true));
        assert_eq!(all, vec![root.join("a.txt"), root.join("sub/c.txt")]);

        let flat = walk_roots(&filter(root.clone(), false));
        assert_eq!(flat, vec![root.join("a.txt")]);
    }

    #[tokio::test]
    async fn test_unseen_tracked_skips_seen_and_deleted() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let root = PathBuf::from("/data");
        let kept = TrackedFile::new(root.join("kept.txt"), None);
        let gone = TrackedFile::new(root.join("gone.txt"), None);
        let mut dead = TrackedFile::new(root.join("dead.txt"), None);
        dead.deleted = true;
        for f in [&kept, &gone, &dead] {
            store.upsert(f).await.unwrap();
        }

        let seen: HashSet<PathBuf> = [kept.path.clone()].into_iter().collect();
        let missing = unseen_tracked(&store, &filter(root, true), &seen)
            .await
            .unwrap();
        assert_eq!(missing, vec![gone.path]);
    }
}
