//! Typing indicators at `typing/{session}/{userKey}`.

use crate::entries::{decode_children, millis, now_ms, remove_on_disconnect, FeedClock};
use frontdesk_config_and_utils::SyncTimings;
use parking_lot::Mutex;
use realtime_transport::{layout, user_key, DbPath, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sync_client::{BestEffort, Feed, SyncClient, SyncResult};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEntry {
    #[serde(default)]
    pub name: String,
    /// Epoch milliseconds of the last keystroke.
    #[serde(default)]
    pub ts: i64,
}

/// Names of users typing within `ttl` of `now_ms`, excluding `own_key`,
/// oldest keystroke first.
pub fn active_typists<I>(entries: I, own_key: &str, now_ms: i64, ttl: Duration) -> Vec<String>
where
    I: IntoIterator<Item = (String, TypingEntry)>,
{
    let ttl = millis(ttl);
    let mut fresh: Vec<TypingEntry> = entries
        .into_iter()
        .filter(|(key, entry)| key != own_key && now_ms.saturating_sub(entry.ts) < ttl)
        .map(|(_, entry)| entry)
        .collect();
    fresh.sort_by_key(|entry| entry.ts);
    fresh.into_iter().map(|entry| entry.name).collect()
}

async fn clear_entry(client: &SyncClient, path: &DbPath) -> SyncResult<()> {
    let lease = client.acquire()?;
    lease.remove(path).await?;
    Ok(())
}

/// One user's typing state in one session.
pub struct TypingIndicator {
    client: Arc<SyncClient>,
    user_name: String,
    own_key: String,
    path: DbPath,
    timings: SyncTimings,
    idle_clear: Mutex<Option<JoinHandle<()>>>,
}

impl TypingIndicator {
    pub fn new(
        client: Arc<SyncClient>,
        session_id: &str,
        user_name: &str,
        timings: SyncTimings,
    ) -> Self {
        let own_key = user_key(user_name);
        Self {
            path: layout::typing_entry(session_id, &own_key),
            client,
            user_name: user_name.to_string(),
            own_key,
            timings,
            idle_clear: Mutex::new(None),
        }
    }

    /// Mark the user as typing. The entry is cleared after the idle delay
    /// unless another keystroke comes first.
    pub async fn keystroke(&self) -> BestEffort {
        let outcome = BestEffort::from_result(self.write().await);
        self.arm_idle_clear();
        outcome
    }

    async fn write(&self) -> SyncResult<()> {
        let lease = self.client.acquire()?;
        let entry = TypingEntry {
            name: self.user_name.clone(),
            ts: now_ms(),
        };
        lease.set(&self.path, Value::from_serialize(&entry)?).await?;
        remove_on_disconnect(&lease, &self.path).await
    }

    fn arm_idle_clear(&self) {
        let client = self.client.clone();
        let path = self.path.clone();
        let delay = self.timings.typing_idle_clear();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            BestEffort::from_result(clear_entry(&client, &path).await).discard("typing_idle_clear");
        });
        if let Some(previous) = self.idle_clear.lock().replace(task) {
            previous.abort();
        }
    }

    /// Remove the entry now, e.g. on send.
    pub async fn clear(&self) -> BestEffort {
        if let Some(pending) = self.idle_clear.lock().take() {
            pending.abort();
        }
        BestEffort::from_result(clear_entry(&self.client, &self.path).await)
    }

    /// Other users currently typing in this session. Entries drop out once
    /// they pass the TTL, even when nothing else is written.
    pub fn subscribe(&self) -> Feed<Vec<String>> {
        let Ok(lease) = self.client.acquire_or_skip("subscribe_typing") else {
            return Feed::inert();
        };
        let own_key = self.own_key.clone();
        let ttl = self.timings.typing_ttl();
        let Some(session_path) = self.path.parent() else {
            return Feed::inert();
        };
        let clock = FeedClock::start();
        Feed::open_refreshed(&lease, &session_path, ttl / 4, move |value| {
            active_typists(decode_children(value.as_ref()), &own_key, clock.now_ms(), ttl)
        })
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        if let Some(pending) = self.idle_clear.get_mut().take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_transport::MemoryBackend;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(8);

    fn typing(name: &str, ts: i64) -> (String, TypingEntry) {
        (
            user_key(name),
            TypingEntry {
                name: name.to_string(),
                ts,
            },
        )
    }

    #[test]
    fn stale_and_own_entries_are_hidden() {
        let now = 100_000;
        let names = active_typists(
            [
                typing("Ana", now - 9_000),
                typing("Bo", now - 2_000),
                typing("Me", now),
            ],
            &user_key("Me"),
            now,
            TTL,
        );
        assert_eq!(names, ["Bo"]);
    }

    #[test]
    fn own_entry_hidden_even_when_stale() {
        let names = active_typists([typing("Me", 0)], &user_key("Me"), 100_000, TTL);
        assert!(names.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keystroke_clears_after_idle() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let indicator =
            TypingIndicator::new(SyncClient::new(transport.clone()), "s1", "Ana", SyncTimings::default());
        let path = layout::typing_entry("s1", "Ana");

        assert!(indicator.keystroke().await.is_delivered());
        assert_eq!(backend.snapshot(&path).unwrap()["name"], json!("Ana"));
        assert!(transport.pending_disconnect_hooks().contains(&path));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(indicator.keystroke().await.is_delivered());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(backend.snapshot(&path).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.snapshot(&path), None);
    }

    #[tokio::test]
    async fn clear_removes_immediately_and_others_see_it() {
        let backend = MemoryBackend::new();
        let ana = TypingIndicator::new(
            SyncClient::new(backend.connect_client("frontdesk-ana").unwrap()),
            "s1",
            "Ana",
            SyncTimings::default(),
        );
        let bo = TypingIndicator::new(
            SyncClient::new(backend.connect_client("frontdesk-bo").unwrap()),
            "s1",
            "Bo",
            SyncTimings::default(),
        );

        let mut seen_by_bo = bo.subscribe();
        let mut seen_by_ana = ana.subscribe();
        assert!(seen_by_bo.recv().await.unwrap().is_empty());

        assert!(ana.keystroke().await.is_delivered());
        assert_eq!(seen_by_bo.latest().unwrap(), ["Ana"]);
        assert!(seen_by_ana.latest().unwrap().is_empty());

        assert!(ana.clear().await.is_delivered());
        assert!(seen_by_bo.latest().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn killed_typist_expires_without_further_writes() {
        let backend = MemoryBackend::new();
        backend.seed(
            &layout::typing_entry("s1", &user_key("Ana")),
            json!({"name": "Ana", "ts": now_ms()}),
        );
        let bo = TypingIndicator::new(
            SyncClient::new(backend.connect_client("frontdesk-bo").unwrap()),
            "s1",
            "Bo",
            SyncTimings::default(),
        );

        let mut typists = bo.subscribe();
        assert_eq!(typists.recv().await.unwrap(), ["Ana"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(typists.latest(), Some(Vec::<String>::new()));
        assert!(backend.snapshot(&layout::typing_entry("s1", &user_key("Ana"))).is_some());
    }
}

