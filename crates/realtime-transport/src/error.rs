//! Transport error types.

use thiserror::Error;

/// Errors raised by a realtime transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The client is offline (explicitly, or the network dropped).
    #[error("client is offline")]
    Offline,

    /// The write was refused before reaching the tree (absent value,
    /// overlapping batch paths, read-only path).
    #[error("write rejected: {0}")]
    Rejected(String),

    /// A path segment is empty or contains a forbidden character.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The app identity is already registered with this backend.
    #[error("app identity already registered: {0}")]
    DuplicateApp(String),

    /// The client handle was shut down and must not be used again.
    #[error("transport has been shut down")]
    Shutdown,

    /// The backend cannot perform this operation.
    #[error("not supported by this transport: {0}")]
    Unsupported(&'static str),

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local failure-flag storage could not be read or written.
    #[error("flag storage error: {0}")]
    FlagStorage(String),
}

impl TransportError {
    /// Returns true if the failure is connectivity-related and a later
    /// attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Offline | TransportError::Http(_) => true,
            TransportError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Offline.is_transient());
        assert!(TransportError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!TransportError::Server {
            status: 401,
            message: "Permission denied".into()
        }
        .is_transient());
        assert!(!TransportError::Rejected("absent value".into()).is_transient());
        assert!(!TransportError::Shutdown.is_transient());
    }
}
