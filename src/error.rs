//! Error taxonomy shared by every component.
//!
//! Module errors stay specific (`StateError`, `TransferError`, ...) but each
//! one classifies itself into an [`ErrorClass`], which decides recovery:
//! local and transient classes are retried automatically, while `Auth` and
//! `Corruption` are always surfaced for explicit user action.

use serde::Serialize;

/// Recovery class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Local read/write failure. The file is marked failed and retried on
    /// the next scan.
    Io,
    /// Timeout or connection failure. Retried with backoff, bounded attempts.
    Network,
    /// Credential missing, invalid or expired. Halts all transfer.
    Auth,
    /// The backend's version chain advanced past ours.
    Conflict,
    /// Downloaded bytes did not match their fingerprint.
    Corruption,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Conflict => "conflict",
            Self::Corruption => "corruption",
        }
    }

    /// Whether the class requires explicit user or operator action.
    pub fn requires_attention(&self) -> bool {
        matches!(self, Self::Auth | Self::Corruption)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
