use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::WatchRoot;

/// Suffix of temporary files the engine itself writes during restore.
pub const PART_SUFFIX: &str = ".stormcloud-part";

/// Decides which paths belong to the backup set.
#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: Vec<WatchRoot>,
    excludes: GlobSet,
    /// Directories owned by the engine (state, chunk cache).
    internal: Vec<PathBuf>,
}

impl PathFilter {
    pub fn new(
        roots: Vec<WatchRoot>,
        exclude_patterns: &[String],
        internal: Vec<PathBuf>,
    ) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            roots,
            excludes: builder.build()?,
            internal,
        })
    }

    pub fn roots(&self) -> &[WatchRoot] {
        &self.roots
    }

    /// Whether `path` is inside a root (respecting non-recursive roots) and
    /// not excluded.
    pub fn accepts(&self, path: &Path) -> bool {
        if self.is_internal(path) || self.is_excluded(path) {
            return false;
        }
        self.roots.iter().any(|root| {
            if root.recursive {
                path.starts_with(&root.path) && path != root.path
            } else {
                path.parent() == Some(root.path.as_path())
            }
        })
    }

    /// Whether a directory may contain accepted paths. Used to prune walks.
    pub fn descend(&self, dir: &Path) -> bool {
        if self.is_internal(dir) || self.is_excluded(dir) {
            return false;
        }
        self.roots.iter().any(|root| {
            if root.recursive {
                dir.starts_with(&root.path) || root.path.starts_with(dir)
            } else {
                dir == root.path || root.path.starts_with(dir)
            }
        })
    }

    fn is_internal(&self, path: &Path) -> bool {
        if self.internal.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(PART_SUFFIX))
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excludes.is_match(path) {
            return true;
        }
        path.file_name()
            .is_some_and(|name| self.excludes.is_match(Path::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PathFilter {
        PathFilter::new(
            vec![
                WatchRoot {
                    path: PathBuf::from("/home/u/docs"),
                    recursive: true,
                },
                WatchRoot {
                    path: PathBuf::from("/home/u/desk"),
                    recursive: false,
                },
            ],
            &["*.tmp".to_string(), "**/node_modules/**".to_string()],
            vec![PathBuf::from("/home/u/docs/.stormcloud")],
        )
        .unwrap()
    }

    #[test]
    fn test_recursive_root() {
        let f = filter();
        assert!(f.accepts(Path::new("/home/u/docs/a.txt")));
        assert!(f.accepts(Path::new("/home/u/docs/x/y/z.txt")));
        assert!(!f.accepts(Path::new("/home/u/other/a.txt")));
        assert!(!f.accepts(Path::new("/home/u/docs")));
    }

    #[test]
    fn test_non_recursive_root() {
        let f = filter();
        assert!(f.accepts(Path::new("/home/u/desk/a.txt")));
        assert!(!f.accepts(Path::new("/home/u/desk/sub/a.txt")));
        assert!(f.descend(Path::new("/home/u/desk")));
        assert!(!f.descend(Path::new("/home/u/desk/sub")));
    }

    #[test]
    fn test_excludes_and_internal_paths() {
        let f = filter();
        assert!(!f.accepts(Path::new("/home/u/docs/scratch.tmp")));
        assert!(!f.accepts(Path::new("/home/u/docs/app/node_modules/x.js")));
        assert!(!f.accepts(Path::new("/home/u/docs/.stormcloud/state.db")));
        assert!(!f.accepts(Path::new("/home/u/docs/report.doc.stormcloud-part")));
        assert!(!f.descend(Path::new("/home/u/docs/.stormcloud")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(PathFilter::new(Vec::new(), &["a[".to_string()], Vec::new()).is_err());
    }
}
