//! stormcloud — client-side backup engine.
//!
//! Watches configured folders, detects real content changes, assigns gap-free
//! version numbers per file and uploads encrypted, content-addressed chunks to
//! the Stormcloud backend. Any committed version can be restored atomically.
//!
//! The engine is an explicitly constructed object ([`engine::Engine`]) with a
//! start/stop lifecycle. Presentation layers observe it through a stream of
//! [`engine::SyncState`] snapshots and drive it with [`engine::Command`]s.

#![warn(clippy::all)]

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod restore;
pub mod retry;
pub mod state;
pub mod transfer;
pub mod versions;
pub mod watcher;

pub use engine::{Command, Engine, EngineHandle, EngineState, SyncState};
pub use error::ErrorClass;
