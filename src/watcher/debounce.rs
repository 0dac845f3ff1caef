//! Per-path event coalescing.
//!
//! Events on one path inside the debounce window collapse into a single
//! notification. Kinds merge in timestamp order, so an out-of-order event
//! cannot resurrect a file that was deleted after it. A path that never goes
//! quiet is still released once it has been held for [`MAX_HOLD_WINDOWS`]
//! windows, so a file written continuously gets versioned while it changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::event::ChangeEvent;

/// Longest a busy path is held, in debounce windows.
pub const MAX_HOLD_WINDOWS: u32 = 5;

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    first_seen: Instant,
    quiet_since: Instant,
}

/// Whether an event was absorbed.
#[derive(Debug, PartialEq, Eq)]
pub enum Admit {
    Queued,
    /// The pending map is full; the caller must record the path for rescan.
    Overflow(PathBuf),
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    capacity: usize,
    max_hold: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            max_hold: window * MAX_HOLD_WINDOWS,
            capacity: capacity.max(1),
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) -> Admit {
        if let Some(existing) = self.pending.get_mut(&event.path) {
            let merged = if event.timestamp >= existing.event.timestamp {
                ChangeEvent {
                    kind: existing.event.kind.clone().then(event.kind),
                    timestamp: event.timestamp,
                    path: event.path,
                }
            } else {
                ChangeEvent {
                    kind: event.kind.then(existing.event.kind.clone()),
                    timestamp: existing.event.timestamp,
                    path: event.path,
                }
            };
            existing.event = merged;
            existing.quiet_since = now;
            return Admit::Queued;
        }
        if self.pending.len() >= self.capacity {
            return Admit::Overflow(event.path);
        }
        self.pending.insert(
            event.path.clone(),
            Pending {
                event,
                first_seen: now,
                quiet_since: now,
            },
        );
        Admit::Queued
    }

    fn release_at(&self, p: &Pending) -> Instant {
        (p.quiet_since + self.window).min(p.first_seen + self.max_hold)
    }

    /// Remove and return events that have been quiet for a full window or
    /// held for the maximum time, oldest first.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= self.release_at(p))
            .map(|(path, _)| path.clone())
            .collect();
        let mut events: Vec<ChangeEvent> = ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path))
            .map(|p| p.event)
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        events
    }

    /// Put back an event the consumer could not accept yet. It is released
    /// again on the next drain.
    pub fn requeue(&mut self, event: ChangeEvent, quiet_since: Instant) {
        match self.pending.get_mut(&event.path) {
            // A newer event arrived meanwhile and already absorbed this one's
            // successor; merge so nothing is lost.
            Some(existing) => {
                existing.event.kind = event.kind.then(existing.event.kind.clone());
            }
            None => {
                self.pending.insert(
                    event.path.clone(),
                    Pending {
                        event,
                        first_seen: quiet_since,
                        quiet_since,
                    },
                );
            }
        }
    }

    /// Earliest instant at which some pending event becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| self.release_at(p))
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::ChangeKind;
    use chrono::{TimeZone, Utc};

    fn event(path: &str, kind: ChangeKind, ms: i64) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from(path),
            kind,
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
        }
    }

    #[test]
    fn test_burst_collapses_to_one_event() {
        let mut d = Debouncer::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();
        for i in 0..10 {
            d.push(event("/a", ChangeKind::Modify, i), t0 + Duration::from_millis(i as u64 * 100));
        }
        assert!(d.drain_ready(t0 + Duration::from_secs(1)).is_empty());
        let ready = d.drain_ready(t0 + Duration::from_secs(3));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, ChangeKind::Modify);
        assert_eq!(ready[0].timestamp, Utc.timestamp_millis_opt(9).unwrap());
        assert!(d.is_empty());
    }

    #[test]
    fn test_continuous_writes_released_after_max_hold() {
        let window = Duration::from_secs(2);
        let mut d = Debouncer::new(window, 100);
        let t0 = Instant::now();
        let mut emitted = Vec::new();
        for i in 0..60u64 {
            let now = t0 + Duration::from_secs(i);
            d.push(event("/log", ChangeKind::Modify, i as i64 * 1000), now);
            emitted.extend(d.drain_ready(now + Duration::from_millis(900)));
        }
        // Released at 10s, 21s, 32s, 43s and 54s without ever going quiet
        assert_eq!(emitted.len(), 5);
        assert!(emitted.iter().all(|e| e.kind == ChangeKind::Modify));
        let latest = t0 + Duration::from_secs(60) + window * MAX_HOLD_WINDOWS;
        assert!(d.next_deadline().unwrap() <= latest);
    }

    #[test]
    fn test_out_of_order_delete_still_wins() {
        let mut d = Debouncer::new(Duration::ZERO, 100);
        let now = Instant::now();
        d.push(event("/a", ChangeKind::Delete, 20), now);
        d.push(event("/a", ChangeKind::Modify, 10), now);
        let ready = d.drain_ready(now);
        assert_eq!(ready[0].kind, ChangeKind::Delete);
        assert_eq!(ready[0].timestamp, Utc.timestamp_millis_opt(20).unwrap());
    }

    #[test]
    fn test_recreate_after_delete_is_modify() {
        let mut d = Debouncer::new(Duration::ZERO, 100);
        let now = Instant::now();
        d.push(event("/a", ChangeKind::Delete, 1), now);
        d.push(event("/a", ChangeKind::Create, 2), now);
        assert_eq!(d.drain_ready(now)[0].kind, ChangeKind::Modify);
    }

    #[test]
    fn test_overflow_reports_path() {
        let mut d = Debouncer::new(Duration::from_secs(1), 2);
        let now = Instant::now();
        assert_eq!(d.push(event("/a", ChangeKind::Modify, 1), now), Admit::Queued);
        assert_eq!(d.push(event("/b", ChangeKind::Modify, 1), now), Admit::Queued);
        // Existing paths still merge when full
        assert_eq!(d.push(event("/a", ChangeKind::Modify, 2), now), Admit::Queued);
        assert_eq!(
            d.push(event("/c", ChangeKind::Modify, 1), now),
            Admit::Overflow(PathBuf::from("/c"))
        );
    }

    #[test]
    fn test_requeue_and_deadline() {
        let mut d = Debouncer::new(Duration::from_secs(2), 10);
        let t0 = Instant::now();
        assert_eq!(d.next_deadline(), None);
        d.push(event("/a", ChangeKind::Modify, 1), t0);
        assert_eq!(d.next_deadline(), Some(t0 + Duration::from_secs(2)));

        let ready = d.drain_ready(t0 + Duration::from_secs(2));
        assert_eq!(ready.len(), 1);
        d.requeue(ready[0].clone(), t0);
        assert_eq!(d.len(), 1);
        assert_eq!(d.drain_ready(t0 + Duration::from_secs(2)).len(), 1);
    }
}
