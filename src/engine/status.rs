use serde::Serialize;

use crate::error::ErrorClass;

/// Coarse engine state shown to users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Scanning,
    Syncing,
    Paused,
    /// Transfers halted by an auth rejection until `ClearError`.
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Syncing => "syncing",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot published on every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub state: EngineState,
    /// Events waiting for classification, including dirty paths.
    pub pending_events: usize,
    pub classifying: usize,
    pub uploads_queued: usize,
    pub uploads_in_flight: usize,
    /// Versions committed since the engine started.
    pub versions_committed: u64,
    /// Terminal upload and classification failures since start.
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    /// A rescan was requested while another was running.
    pub rescan_pending: bool,
    pub scans_completed: u64,
    pub collecting_garbage: bool,
}

/// Inputs the coarse state is derived from.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Activity {
    pub halted: bool,
    pub paused: bool,
    pub scanning: bool,
    pub busy: bool,
}

impl Activity {
    pub fn state(self) -> EngineState {
        if self.halted {
            EngineState::Error
        } else if self.paused {
            EngineState::Paused
        } else if self.scanning {
            EngineState::Scanning
        } else if self.busy {
            EngineState::Syncing
        } else {
            EngineState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_outranks_everything() {
        let activity = Activity {
            halted: true,
            paused: true,
            scanning: true,
            busy: true,
        };
        assert_eq!(activity.state(), EngineState::Error);
    }

    #[test]
    fn test_state_precedence() {
        let mut activity = Activity::default();
        assert_eq!(activity.state(), EngineState::Idle);
        activity.busy = true;
        assert_eq!(activity.state(), EngineState::Syncing);
        activity.scanning = true;
        assert_eq!(activity.state(), EngineState::Scanning);
        activity.paused = true;
        assert_eq!(activity.state(), EngineState::Paused);
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let snapshot = SyncState {
            state: EngineState::Syncing,
            last_error_class: Some(ErrorClass::Auth),
            ..SyncState::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "syncing");
        assert_eq!(json["uploads_queued"], 0);
    }
}
