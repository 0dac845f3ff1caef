//! systemd readiness and status notifications.
//!
//! Every method is a no-op when disabled or off Linux, so callers need no
//! `#[cfg]` of their own.

use stormcloud::SyncState;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`: the engine is running.
    pub(crate) fn notify_ready(&self) {
        if self.enabled {
            send(&[NotifyKind::Ready]);
        }
    }

    /// `STOPPING=1`: draining uploads.
    pub(crate) fn notify_stopping(&self) {
        if self.enabled {
            send(&[NotifyKind::Stopping]);
        }
    }

    /// `STATUS=` line for `systemctl status`, plus a watchdog ping.
    pub(crate) fn notify_sync_state(&self, state: &SyncState) {
        if !self.enabled {
            return;
        }
        let line = status_line(state);
        send(&[NotifyKind::Status(&line), NotifyKind::Watchdog]);
    }
}

fn status_line(state: &SyncState) -> String {
    let mut line = format!(
        "{}: {} queued, {} uploading, {} committed",
        state.state, state.uploads_queued, state.uploads_in_flight, state.versions_committed
    );
    if state.failures > 0 {
        line.push_str(&format!(", {} failed", state.failures));
    }
    if let Some(error) = &state.last_error {
        line.push_str(&format!(" (last error: {error})"));
    }
    line
}

enum NotifyKind<'a> {
    Ready,
    Stopping,
    Status(&'a str),
    Watchdog,
}

#[cfg(target_os = "linux")]
fn send(kinds: &[NotifyKind<'_>]) {
    let states: Vec<sd_notify::NotifyState<'_>> = kinds
        .iter()
        .map(|kind| match kind {
            NotifyKind::Ready => sd_notify::NotifyState::Ready,
            NotifyKind::Stopping => sd_notify::NotifyState::Stopping,
            NotifyKind::Status(msg) => sd_notify::NotifyState::Status(msg),
            NotifyKind::Watchdog => sd_notify::NotifyState::Watchdog,
        })
        .collect();
    if let Err(e) = sd_notify::notify(false, &states) {
        tracing::debug!(error = %e, "sd_notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn send(_kinds: &[NotifyKind<'_>]) {}

#[cfg(test)]
mod tests {
    use super::*;
    use stormcloud::EngineState;

    #[test]
    fn disabled_notifier_is_noop() {
        let n = SystemdNotifier::new(false);
        n.notify_ready();
        n.notify_sync_state(&SyncState::default());
        n.notify_stopping();
    }

    #[test]
    fn enabled_notifier_does_not_panic() {
        // Without NOTIFY_SOCKET this only logs at debug
        let n = SystemdNotifier::new(true);
        n.notify_ready();
        n.notify_sync_state(&SyncState::default());
        n.notify_stopping();
    }

    #[test]
    fn status_line_mentions_errors() {
        let state = SyncState {
            state: EngineState::Error,
            failures: 2,
            last_error: Some("credentials revoked".into()),
            ..SyncState::default()
        };
        assert_eq!(
            status_line(&state),
            "error: 0 queued, 0 uploading, 0 committed, 2 failed (last error: credentials revoked)"
        );
    }
}
