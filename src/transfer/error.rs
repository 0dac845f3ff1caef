use thiserror::Error;

use crate::error::ErrorClass;
use crate::state::StateError;

/// Typed transfer errors enabling retry classification.
///
/// `is_retryable()` separates transient failures (timeouts, connection
/// resets, rate limits, server errors) from permanent ones (credentials,
/// conflicts, local disk failures) so the retry loop can abort early.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("Request to {endpoint} failed: {source}")]
    Http {
        source: reqwest::Error,
        endpoint: String,
    },

    #[error("Backend unreachable: {0}")]
    Unavailable(String),

    #[error("Backend rejected credentials: {0}")]
    Auth(String),

    #[error("Version chain conflict: backend head is {server_head:?}, expected parent {expected:?}")]
    Conflict {
        server_head: Option<u64>,
        expected: Option<u64>,
    },

    #[error("Chunk {0} failed verification")]
    Corruption(String),

    #[error("Source file changed since it was classified: {0}")]
    Stale(String),

    #[error("Chunk not found on backend: {0}")]
    NotFound(String),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Chunk encryption failed")]
    Crypto,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Http { source, .. } => !source.is_builder() && !source.is_decode(),
            Self::Unavailable(_) => true,
            Self::Auth(_)
            | Self::Conflict { .. }
            | Self::Corruption(_)
            | Self::Stale(_)
            | Self::NotFound(_)
            | Self::Disk(_)
            | Self::Crypto
            | Self::State(_)
            | Self::Other(_) => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::HttpStatus { .. } | Self::Http { .. } | Self::Unavailable(_) => {
                ErrorClass::Network
            }
            Self::NotFound(_) => ErrorClass::Network,
            Self::Auth(_) => ErrorClass::Auth,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Corruption(_) | Self::Crypto => ErrorClass::Corruption,
            Self::Stale(_) | Self::Disk(_) | Self::State(_) | Self::Other(_) => ErrorClass::Io,
        }
    }
}
