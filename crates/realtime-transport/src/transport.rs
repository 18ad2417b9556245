//! The transport abstraction over the realtime backing store.

use crate::{DbPath, TransportError, TransportResult, Value};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A multi-path update: every entry is written atomically in one call.
pub type WriteBatch = BTreeMap<DbPath, Value>;

/// Callback invoked with the current value at a listened path (`None` when
/// nothing is stored there). Callbacks run outside transport locks.
pub type ListenerFn = Arc<dyn Fn(Option<JsonValue>) + Send + Sync>;

/// Handle identifying one registered listener on one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// One client connection to the realtime store.
///
/// All reads return values in read shape (see [`crate::wire`]). Writes
/// containing [`Value::Absent`] are rejected; callers sanitize first.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this client registered under.
    fn app_name(&self) -> &str;

    /// Read the value at `path` once.
    async fn get_once(&self, path: &DbPath) -> TransportResult<Option<JsonValue>>;

    /// Atomically write every entry of `batch`. Null entries delete.
    async fn update(&self, batch: WriteBatch) -> TransportResult<()>;

    /// Replace the value at `path`.
    async fn set(&self, path: &DbPath, value: Value) -> TransportResult<()>;

    /// Delete the value at `path`.
    async fn remove(&self, path: &DbPath) -> TransportResult<()>;

    /// A new chronologically ordered child key.
    fn push_key(&self) -> String;

    /// Register a value listener on `path`. The current value is delivered
    /// once the client is connected, then again on every change.
    fn listen(&self, path: &DbPath, listener: ListenerFn) -> ListenerId;

    /// Remove one listener. Returns false if it was already gone.
    fn unlisten(&self, id: ListenerId) -> bool;

    /// Remove every listener on exactly `path`, including ones registered
    /// by other components. Returns how many were removed.
    fn off_path(&self, path: &DbPath) -> usize;

    /// Ask the backend to delete `path` when this client disconnects.
    async fn on_disconnect_remove(&self, path: &DbPath) -> TransportResult<()>;

    /// Drop the connection and stay offline until [`Transport::go_online`].
    fn go_offline(&self);

    /// Request the connection back.
    fn go_online(&self);

    fn is_connected(&self) -> bool;

    /// Number of listeners currently registered on this client.
    fn listener_count(&self) -> usize;

    /// Tear the client down. Every later call fails with
    /// [`TransportError::Shutdown`] or is a no-op.
    fn shutdown(&self);
}

/// Creates client connections under a given identity.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, app_name: &str) -> TransportResult<Arc<dyn Transport>>;
}

/// Validate a single write target.
pub fn validate_write_path(path: &DbPath) -> TransportResult<()> {
    path.validate()?;
    if path.is_metadata() {
        return Err(TransportError::Rejected(format!("{path} is read-only")));
    }
    Ok(())
}

/// Reject a multi-path batch the server would refuse. Paths must not
/// overlap, and absent values must have been sanitized away.
pub fn validate_batch(batch: &WriteBatch) -> TransportResult<()> {
    if batch.is_empty() {
        return Err(TransportError::Rejected("empty update".to_string()));
    }
    for (path, value) in batch {
        validate_write_path(path)?;
        if value.contains_absent() {
            return Err(TransportError::Rejected(format!(
                "absent value at {path}"
            )));
        }
    }
    // Sorted order puts an ancestor right before some path it contains.
    let paths: Vec<&DbPath> = batch.keys().collect();
    for pair in paths.windows(2) {
        if pair[0].is_ancestor_of(pair[1]) {
            return Err(TransportError::Rejected(format!(
                "overlapping paths {} and {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}
