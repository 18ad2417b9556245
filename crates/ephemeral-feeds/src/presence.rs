//! Who is viewing which session.
//!
//! Each device writes `presence/{session}/{device}` on join, registers a
//! disconnect hook for it, and refreshes `lastSeen` every heartbeat.
//! Readers count only entries seen within the presence TTL, which covers
//! clients killed before their hook could fire.

use crate::entries::{decode_children, millis, now_ms, remove_on_disconnect, FeedClock};
use frontdesk_config_and_utils::SyncTimings;
use realtime_transport::{layout, sanitize, JsonValue, Value, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{BestEffort, Feed, SyncClient, SyncResult};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    #[serde(default)]
    pub joined_at: i64,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub user_name: String,
}

/// A live viewer of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub device_id: String,
    pub user_name: String,
    pub joined_at: i64,
    pub last_seen: i64,
}

/// True if `entry` was refreshed within `ttl` of `now_ms`.
pub fn is_live(entry: &PresenceEntry, now_ms: i64, ttl: Duration) -> bool {
    now_ms.saturating_sub(entry.last_seen) <= millis(ttl)
}

/// Live viewers among `entries`, earliest joiner first.
pub fn active_viewers<I>(entries: I, now_ms: i64, ttl: Duration) -> Vec<Viewer>
where
    I: IntoIterator<Item = (String, PresenceEntry)>,
{
    let mut viewers: Vec<Viewer> = entries
        .into_iter()
        .filter(|(_, entry)| is_live(entry, now_ms, ttl))
        .map(|(device_id, entry)| Viewer {
            device_id,
            user_name: entry.user_name,
            joined_at: entry.joined_at,
            last_seen: entry.last_seen,
        })
        .collect();
    viewers.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
    viewers
}

/// Live viewer count per session for the whole `presence/` tree. Sessions
/// with no live viewer are left out.
pub fn viewer_counts(tree: Option<&JsonValue>, now_ms: i64, ttl: Duration) -> BTreeMap<String, usize> {
    crate::entries::children(tree)
        .into_iter()
        .filter_map(|(session_id, devices)| {
            let live = active_viewers(decode_children(Some(&devices)), now_ms, ttl).len();
            (live > 0).then_some((session_id, live))
        })
        .collect()
}

/// Writes this device's entry and keeps it fresh.
async fn announce(
    client: &SyncClient,
    session_id: &str,
    device_id: &str,
    entry: &PresenceEntry,
) -> SyncResult<()> {
    let lease = client.acquire()?;
    let entry_path = layout::presence_entry(session_id, device_id);
    let heartbeat_path = layout::heartbeat(session_id, device_id);

    let mut batch = WriteBatch::new();
    batch.insert(entry_path.clone(), sanitize(Value::from_serialize(entry)?));
    batch.insert(heartbeat_path.clone(), Value::ServerTimestamp);
    client.validate(&lease)?;
    lease.update(batch).await?;

    // Hooks are consumed by a disconnect, so they are re-registered each time.
    remove_on_disconnect(&lease, &entry_path).await?;
    remove_on_disconnect(&lease, &heartbeat_path).await
}

/// Presence for one device.
#[derive(Clone)]
pub struct PresenceTracker {
    client: Arc<SyncClient>,
    device_id: String,
    user_agent: String,
    timings: SyncTimings,
}

impl PresenceTracker {
    pub fn new(client: Arc<SyncClient>, device_id: impl Into<String>, timings: SyncTimings) -> Self {
        Self {
            client,
            device_id: device_id.into(),
            user_agent: concat!("frontdesk/", env!("CARGO_PKG_VERSION")).to_string(),
            timings,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Announce this device on `session_id` and start the heartbeat. The
    /// heartbeat runs until the returned session is left or dropped.
    pub async fn join(&self, session_id: &str, user_name: &str) -> PresenceSession {
        let now = now_ms();
        let entry = PresenceEntry {
            joined_at: now,
            last_seen: now,
            user_agent: self.user_agent.clone(),
            user_name: user_name.to_string(),
        };
        let joined = BestEffort::from_result(
            announce(&self.client, session_id, &self.device_id, &entry).await,
        );
        info!(session_id, device_id = %self.device_id, outcome = ?joined, "Joined session presence");

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            session_id.to_string(),
            self.device_id.clone(),
            entry,
            self.timings.presence_heartbeat(),
        ));

        PresenceSession {
            client: self.client.clone(),
            session_id: session_id.to_string(),
            device_id: self.device_id.clone(),
            heartbeat: Some(heartbeat),
            joined,
        }
    }

    /// Live viewers of one session, re-filtered every heartbeat period so
    /// that viewers who stopped heartbeating age out.
    pub fn subscribe_session(&self, session_id: &str) -> Feed<Vec<Viewer>> {
        let Ok(lease) = self.client.acquire_or_skip("subscribe_presence") else {
            return Feed::inert();
        };
        let ttl = self.timings.presence_ttl();
        let clock = FeedClock::start();
        Feed::open_refreshed(
            &lease,
            &layout::presence_session(session_id),
            self.timings.presence_heartbeat(),
            move |value| active_viewers(decode_children(value.as_ref()), clock.now_ms(), ttl),
        )
    }

    /// Live viewer counts for every session.
    pub fn subscribe_counts(&self) -> Feed<BTreeMap<String, usize>> {
        let Ok(lease) = self.client.acquire_or_skip("subscribe_presence_counts") else {
            return Feed::inert();
        };
        let ttl = self.timings.presence_ttl();
        let clock = FeedClock::start();
        Feed::open_refreshed(
            &lease,
            &layout::presence_root(),
            self.timings.presence_heartbeat(),
            move |value| viewer_counts(value.as_ref(), clock.now_ms(), ttl),
        )
    }
}

async fn heartbeat_loop(
    client: Arc<SyncClient>,
    session_id: String,
    device_id: String,
    mut entry: PresenceEntry,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        entry.last_seen = now_ms();
        BestEffort::from_result(announce(&client, &session_id, &device_id, &entry).await)
            .discard("presence_heartbeat");
    }
}

/// A joined session. Dropping it stops the heartbeat; the entry then ages
/// out or is removed by the disconnect hook.
pub struct PresenceSession {
    client: Arc<SyncClient>,
    session_id: String,
    device_id: String,
    heartbeat: Option<JoinHandle<()>>,
    joined: BestEffort,
}

impl PresenceSession {
    /// Result of the initial announcement.
    pub fn joined(&self) -> &BestEffort {
        &self.joined
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop the heartbeat and remove this device's entry.
    pub async fn leave(mut self) -> BestEffort {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let outcome = BestEffort::from_result(self.remove().await);
        debug!(session_id = %self.session_id, outcome = ?outcome, "Left session presence");
        outcome
    }

    async fn remove(&self) -> SyncResult<()> {
        let lease = self.client.acquire()?;
        let mut batch = WriteBatch::new();
        batch.insert(
            layout::presence_entry(&self.session_id, &self.device_id),
            Value::Null,
        );
        batch.insert(layout::heartbeat(&self.session_id, &self.device_id), Value::Null);
        lease.update(batch).await?;
        Ok(())
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_transport::{MemoryBackend, Transport};
    use serde_json::json;
    use sync_client::SkipReason;

    const TTL: Duration = Duration::from_secs(120);

    fn entry(last_seen: i64) -> PresenceEntry {
        PresenceEntry {
            joined_at: 0,
            last_seen,
            user_agent: String::new(),
            user_name: "Ana".into(),
        }
    }

    #[test]
    fn entries_older_than_ttl_are_not_viewers() {
        let now = 1_000_000;
        let viewers = active_viewers(
            [
                ("stale".to_string(), entry(now - 121_000)),
                ("fresh".to_string(), entry(now - 60_000)),
            ],
            now,
            TTL,
        );
        assert_eq!(viewers.len(), 1);
        assert_eq!(viewers[0].device_id, "fresh");
    }

    #[test]
    fn counts_group_by_session() {
        let now = 500_000;
        let tree = json!({
            "s1": {
                "d1": {"lastSeen": now - 1_000, "userName": "Ana"},
                "d2": {"lastSeen": now - 200_000, "userName": "Bo"}
            },
            "s2": {"d3": {"lastSeen": now - 300_000}},
            "s3": {"d4": {"lastSeen": now, "userName": "Cy"}}
        });
        let counts = viewer_counts(Some(&tree), now, TTL);
        assert_eq!(counts.get("s1"), Some(&1));
        assert_eq!(counts.get("s2"), None);
        assert_eq!(counts.get("s3"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn join_heartbeat_and_leave() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let tracker = PresenceTracker::new(
            SyncClient::new(transport.clone()),
            "device-1",
            SyncTimings::default(),
        );

        let session = tracker.join("s1", "Ana").await;
        assert!(session.joined().is_delivered());
        let path = layout::presence_entry("s1", "device-1");
        assert_eq!(backend.snapshot(&path).unwrap()["userName"], json!("Ana"));
        assert!(transport.pending_disconnect_hooks().contains(&path));

        let updates = transport.stats().update;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.stats().update, updates + 1);

        assert!(session.leave().await.is_delivered());
        assert_eq!(backend.snapshot(&path), None);
        assert_eq!(backend.snapshot(&layout::heartbeat("s1", "device-1")), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.stats().update, updates + 2);
    }

    #[tokio::test]
    async fn disconnect_hook_removes_entry() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let tracker = PresenceTracker::new(
            SyncClient::new(transport.clone()),
            "device-1",
            SyncTimings::default(),
        );
        let watcher = backend.connect_client("frontdesk-desk").unwrap();

        let _session = tracker.join("s1", "Ana").await;
        backend.drop_connection("frontdesk", false);

        assert_eq!(
            watcher.get_once(&layout::presence_session("s1")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn uninitialised_client_joins_as_skipped() {
        let tracker = PresenceTracker::new(
            SyncClient::uninitialized("frontdesk"),
            "device-1",
            SyncTimings::default(),
        );
        let session = tracker.join("s1", "Ana").await;
        assert_eq!(
            session.joined(),
            &BestEffort::Skipped(SkipReason::NotInitialized)
        );
        assert_eq!(
            session.leave().await,
            BestEffort::Skipped(SkipReason::NotInitialized)
        );
        assert!(!tracker.subscribe_session("s1").is_active());
    }

    #[tokio::test]
    async fn feed_reports_live_viewers() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let tracker = PresenceTracker::new(
            SyncClient::new(transport),
            "device-1",
            SyncTimings::default(),
        );
        backend.seed(
            &layout::presence_entry("s1", "ghost"),
            json!({"joinedAt": 1, "lastSeen": 1, "userName": "Gone"}),
        );

        let mut viewers = tracker.subscribe_session("s1");
        assert!(viewers.recv().await.unwrap().is_empty());

        let _session = tracker.join("s1", "Ana").await;
        let live = viewers.latest().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].user_name, "Ana");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewer_ages_out_without_further_writes() {
        let backend = MemoryBackend::new();
        let tracker = PresenceTracker::new(
            SyncClient::new(backend.connect_client("frontdesk").unwrap()),
            "device-1",
            SyncTimings::default(),
        );
        let seen = now_ms();
        backend.seed(
            &layout::presence_entry("s1", "killed-tablet"),
            json!({"joinedAt": seen, "lastSeen": seen, "userName": "Bo"}),
        );

        let mut viewers = tracker.subscribe_session("s1");
        let mut counts = tracker.subscribe_counts();
        assert_eq!(viewers.recv().await.unwrap().len(), 1);
        assert_eq!(counts.recv().await.unwrap().get("s1"), Some(&1));

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(viewers.try_recv(), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(viewers.latest().unwrap().is_empty());
        assert!(counts.latest().unwrap().is_empty());
    }
}
