use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Kind of filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    /// The file now at `path` previously lived at `from`.
    Rename { from: PathBuf },
}

impl ChangeKind {
    /// Combine an earlier kind with a later one on the same path.
    ///
    /// A delete after anything is a delete. Anything written after a delete
    /// is a modify of whatever now lives at the path. A rename keeps its
    /// source through later writes.
    pub fn then(self, later: ChangeKind) -> ChangeKind {
        match (self, later) {
            (_, ChangeKind::Delete) => ChangeKind::Delete,
            (ChangeKind::Delete, ChangeKind::Create | ChangeKind::Modify) => ChangeKind::Modify,
            (ChangeKind::Rename { from }, ChangeKind::Create | ChangeKind::Modify) => {
                ChangeKind::Rename { from }
            }
            (_, later) => later,
        }
    }
}

/// A normalized change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_after_modify_wins() {
        assert_eq!(ChangeKind::Modify.then(ChangeKind::Delete), ChangeKind::Delete);
        assert_eq!(ChangeKind::Create.then(ChangeKind::Delete), ChangeKind::Delete);
    }

    #[test]
    fn test_write_after_delete_is_modify() {
        assert_eq!(ChangeKind::Delete.then(ChangeKind::Create), ChangeKind::Modify);
        assert_eq!(ChangeKind::Delete.then(ChangeKind::Modify), ChangeKind::Modify);
    }

    #[test]
    fn test_rename_survives_later_writes() {
        let rename = ChangeKind::Rename {
            from: PathBuf::from("/a"),
        };
        assert_eq!(rename.clone().then(ChangeKind::Modify), rename);
        assert_eq!(ChangeKind::Modify.then(rename.clone()), rename);
    }
}
