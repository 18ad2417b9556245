//! Helpers shared by the feeds.

use realtime_transport::{DbPath, JsonValue, TransportError};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;
use sync_client::{ClientLease, SyncResult};
use tracing::{debug, warn};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock milliseconds that advance with the runtime's monotonic
/// clock from the moment the clock is taken. Age filters read it so that
/// expiry follows `tokio::time`, including when the clock is paused.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeedClock {
    wall_ms: i64,
    started: Instant,
}

impl FeedClock {
    pub fn start() -> Self {
        Self {
            wall_ms: now_ms(),
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.wall_ms.saturating_add(millis(self.started.elapsed()))
    }
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// `(key, child)` pairs of a keyed collection. Collections whose keys look
/// like list positions may arrive as arrays; their keys are the indices.
pub(crate) fn children(value: Option<&JsonValue>) -> Vec<(String, JsonValue)> {
    match value {
        Some(JsonValue::Object(map)) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode every child, dropping ones that do not fit `T`.
pub(crate) fn decode_children<T: DeserializeOwned>(value: Option<&JsonValue>) -> Vec<(String, T)> {
    children(value)
        .into_iter()
        .filter_map(|(key, raw)| match serde_json::from_value(raw) {
            Ok(item) => Some((key, item)),
            Err(e) => {
                warn!(%key, error = %e, "Skipping undecodable feed entry");
                None
            }
        })
        .collect()
}

/// Ask the backend to remove `path` on disconnect. Transports without
/// disconnect hooks are tolerated; the age filters cover them.
pub(crate) async fn remove_on_disconnect(lease: &ClientLease, path: &DbPath) -> SyncResult<()> {
    match lease.on_disconnect_remove(path).await {
        Ok(()) => Ok(()),
        Err(TransportError::Unsupported(what)) => {
            debug!(%path, what, "Disconnect hook unavailable");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
