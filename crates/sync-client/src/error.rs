//! Error types shared by every store built on the sync client.

use crate::SkipReason;
use realtime_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No backing-store client exists (credentials absent or never created).
    #[error("realtime client not initialized")]
    NotInitialized,

    /// A reconnect tier currently owns the client.
    #[error("reconnect in progress")]
    ReconnectInProgress,

    /// The client was replaced while the operation held the old handle.
    #[error("stale client handle: generation {held}, current {current}")]
    StaleHandle { held: u64, current: u64 },

    /// Referenced session or guest does not exist at operation time.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// The soft-degradation reason, if this error means "client unavailable".
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            SyncError::NotInitialized => Some(SkipReason::NotInitialized),
            SyncError::ReconnectInProgress | SyncError::StaleHandle { .. } => {
                Some(SkipReason::ReconnectInProgress)
            }
            _ => None,
        }
    }

    /// True for connectivity failures the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(e) if e.is_transient())
    }
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
