//! Work waiting for a classification slot.
//!
//! Live events coalesce per path while they wait, so a burst on one file
//! holds a single entry no matter how fast the watcher delivers. Scan items
//! are kept as they are; each belongs to a phase count.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use super::{Origin, WorkItem};
use crate::watcher::ChangeEvent;

#[derive(Debug)]
enum Slot {
    Live(PathBuf),
    Item(WorkItem),
}

#[derive(Debug, Default)]
pub(crate) struct Backlog {
    order: VecDeque<Slot>,
    live: HashMap<PathBuf, ChangeEvent>,
}

impl Backlog {
    /// Queue a live event, merging it into a waiting one for the same path.
    /// Returns `false` when it was merged.
    pub(crate) fn push_live(&mut self, event: ChangeEvent) -> bool {
        if let Some(waiting) = self.live.get_mut(&event.path) {
            if event.timestamp >= waiting.timestamp {
                waiting.kind = waiting.kind.clone().then(event.kind);
                waiting.timestamp = event.timestamp;
            } else {
                waiting.kind = event.kind.then(waiting.kind.clone());
            }
            return false;
        }
        self.order.push_back(Slot::Live(event.path.clone()));
        self.live.insert(event.path.clone(), event);
        true
    }

    pub(crate) fn push(&mut self, item: WorkItem) {
        if item.origin == Origin::Live {
            self.push_live(item.event);
        } else {
            self.order.push_back(Slot::Item(item));
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<WorkItem> {
        while let Some(slot) = self.order.pop_front() {
            match slot {
                Slot::Item(item) => return Some(item),
                Slot::Live(path) => {
                    if let Some(event) = self.live.remove(&path) {
                        return Some(WorkItem {
                            event,
                            force: false,
                            origin: Origin::Live,
                        });
                    }
                }
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChangeKind;
    use chrono::{Duration, Utc};

    fn live(path: &str, kind: ChangeKind, offset_ms: i64) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from(path),
            kind,
            timestamp: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_live_burst_holds_one_entry_per_path() {
        let mut backlog = Backlog::default();
        assert!(backlog.push_live(live("/a", ChangeKind::Modify, 0)));
        assert!(backlog.push_live(live("/b", ChangeKind::Modify, 0)));
        for i in 1..1000 {
            assert!(!backlog.push_live(live("/a", ChangeKind::Modify, i)));
        }
        assert!(!backlog.push_live(live("/a", ChangeKind::Delete, 2000)));
        assert_eq!(backlog.len(), 2);

        let first = backlog.pop_front().unwrap();
        assert_eq!(first.event.path, PathBuf::from("/a"));
        assert_eq!(first.event.kind, ChangeKind::Delete);
        assert_eq!(first.origin, Origin::Live);
        assert_eq!(backlog.pop_front().unwrap().event.path, PathBuf::from("/b"));
        assert!(backlog.pop_front().is_none());
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_path_requeues_after_dispatch() {
        let mut backlog = Backlog::default();
        backlog.push_live(live("/a", ChangeKind::Modify, 0));
        backlog.pop_front().unwrap();
        assert!(backlog.push_live(live("/a", ChangeKind::Modify, 10)));
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn test_scan_items_are_not_merged() {
        let mut backlog = Backlog::default();
        for _ in 0..2 {
            backlog.push(WorkItem {
                event: live("/a", ChangeKind::Modify, 0),
                force: true,
                origin: Origin::Scan(1),
            });
        }
        backlog.push_live(live("/a", ChangeKind::Modify, 0));
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.pop_front().unwrap().origin, Origin::Scan(1));
        assert_eq!(backlog.pop_front().unwrap().origin, Origin::Scan(1));
        assert_eq!(backlog.pop_front().unwrap().origin, Origin::Live);
    }
}
