//! Per-file FIFO job queue.
//!
//! Jobs of one file leave the queue in allocation order and never overlap:
//! a file with a job in flight is not ready again until that job finishes.
//! Different files are served round-robin.

use std::collections::{HashMap, VecDeque};

use tokio::sync::OwnedSemaphorePermit;

use super::job::UploadJob;
use crate::state::FileId;

/// A queued job and its slot in the bounded upload queue.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub job: UploadJob,
    pub _slot: OwnedSemaphorePermit,
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queues: HashMap<FileId, VecDeque<Ticket>>,
    ready: VecDeque<FileId>,
    /// Files with a job running, and that job's version.
    in_flight: HashMap<FileId, u64>,
}

impl Scheduler {
    pub fn push(&mut self, ticket: Ticket) {
        let id = ticket.job.file_id();
        let queue = self.queues.entry(id).or_default();
        let was_empty = queue.is_empty();
        // Keep version order even when a requeued job races a new one
        let pos = queue
            .iter()
            .position(|t| t.job.version.version > ticket.job.version.version)
            .unwrap_or(queue.len());
        queue.insert(pos, ticket);
        if was_empty && !self.in_flight.contains_key(&id) {
            self.ready.push_back(id);
        }
    }

    /// Put an interrupted job back at the head of its file's queue.
    /// The file must still be in flight; `finish` makes it ready.
    pub fn push_front(&mut self, ticket: Ticket) {
        let id = ticket.job.file_id();
        self.queues.entry(id).or_default().push_front(ticket);
    }

    pub fn next(&mut self) -> Option<Ticket> {
        while let Some(id) = self.ready.pop_front() {
            let Some(queue) = self.queues.get_mut(&id) else {
                continue;
            };
            let Some(ticket) = queue.pop_front() else {
                self.queues.remove(&id);
                continue;
            };
            if queue.is_empty() {
                self.queues.remove(&id);
            }
            self.in_flight.insert(id, ticket.job.version.version);
            return Some(ticket);
        }
        None
    }

    pub fn finish(&mut self, id: FileId) {
        self.in_flight.remove(&id);
        if self.queues.get(&id).is_some_and(|q| !q.is_empty()) && !self.ready.contains(&id) {
            self.ready.push_back(id);
        }
    }

    /// Remove queued jobs of `id` at or after `version`.
    pub fn drop_from(&mut self, id: FileId, version: u64) -> Vec<UploadJob> {
        let Some(queue) = self.queues.get_mut(&id) else {
            return Vec::new();
        };
        let mut dropped = Vec::new();
        queue.retain_mut(|t| {
            if t.job.version.version >= version {
                dropped.push(t.job.clone());
                false
            } else {
                true
            }
        });
        if queue.is_empty() {
            self.queues.remove(&id);
            self.ready.retain(|r| *r != id);
        }
        dropped
    }

    /// Whether `version` of `id` is queued or running.
    pub fn contains(&self, id: FileId, version: u64) -> bool {
        self.in_flight.get(&id) == Some(&version)
            || self
                .queues
                .get(&id)
                .is_some_and(|q| q.iter().any(|t| t.job.version.version == version))
    }

    pub fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
