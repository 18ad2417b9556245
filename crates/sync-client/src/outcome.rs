//! Outcome types for operations that degrade instead of failing.
//!
//! A store call made while the client is unavailable does nothing and says
//! so through one of these values. Best-effort writes (heartbeats, presence,
//! typing) return [`BestEffort`], which callers explicitly
//! [`discard`](BestEffort::discard).

use crate::{SyncError, SyncResult};
use std::fmt;
use tracing::debug;

/// Why an operation did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInitialized,
    ReconnectInProgress,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotInitialized => "not_initialized",
            SkipReason::ReconnectInProgress => "reconnect_in_progress",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an atomic field patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The multi-path update was written.
    Applied {
        /// Array index the guest resolved to at patch time.
        index: usize,
        /// Number of guest fields written (the timestamp is not counted).
        fields: usize,
    },
    Skipped(SkipReason),
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied { .. })
    }
}

/// Result of a full-document write guarded by a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Remote copy is newer; nothing was written.
    SkippedStale { local: i64, remote: i64 },
    Skipped(SkipReason),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

/// Result of appending a keyed child, such as a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written under this push key.
    Sent(String),
    Skipped(SkipReason),
}

impl SendOutcome {
    /// The new child's key, if it was written.
    pub fn key(&self) -> Option<&str> {
        match self {
            SendOutcome::Sent(key) => Some(key),
            SendOutcome::Skipped(_) => None,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent(_))
    }
}

/// Result of a fire-and-forget write.
#[must_use = "best-effort results are discarded explicitly with .discard()"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Delivered,
    Skipped(SkipReason),
    Failed(String),
}

impl BestEffort {
    pub fn from_result(result: SyncResult<()>) -> Self {
        match result {
            Ok(()) => BestEffort::Delivered,
            Err(e) => match e.skip_reason() {
                Some(reason) => BestEffort::Skipped(reason),
                None => BestEffort::Failed(e.to_string()),
            },
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, BestEffort::Delivered)
    }

    /// Drop the result, logging anything that was not delivered.
    pub fn discard(self, operation: &str) {
        match self {
            BestEffort::Delivered => {}
            BestEffort::Skipped(reason) => {
                debug!(operation, reason = %reason, "Best-effort write skipped");
            }
            BestEffort::Failed(error) => {
                debug!(operation, error = %error, "Best-effort write dropped");
            }
        }
    }
}

impl From<SyncResult<()>> for BestEffort {
    fn from(result: SyncResult<()>) -> Self {
        Self::from_result(result)
    }
}

impl From<SkipReason> for SyncError {
    fn from(reason: SkipReason) -> Self {
        match reason {
            SkipReason::NotInitialized => SyncError::NotInitialized,
            SkipReason::ReconnectInProgress => SyncError::ReconnectInProgress,
        }
    }
}
