//! Typed live feeds over transport listeners.

use crate::{ClientLease, Subscription};
use parking_lot::Mutex;
use realtime_transport::{DbPath, JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A stream of decoded snapshots of one path.
///
/// Every change at the path produces one item. Dropping the feed (or
/// calling [`Feed::unsubscribe`]) removes exactly this feed's listener.
pub struct Feed<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    subscription: Subscription,
    refresh: Option<RefreshTask>,
}

/// Aborts the re-evaluation task when the feed goes away.
struct RefreshTask(JoinHandle<()>);

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Last raw snapshot and the item it decoded to.
struct Snapshot<T> {
    raw: Option<JsonValue>,
    delivered: Option<T>,
}

impl<T: Send + 'static> Feed<T> {
    /// Register a listener on `path`, decoding each snapshot with `decode`.
    /// Missing data arrives as `None`; decoders return an empty default.
    pub fn open<F>(lease: &ClientLease, path: &DbPath, decode: F) -> Self
    where
        F: Fn(Option<JsonValue>) -> T + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = lease.listen(
            path,
            Arc::new(move |value| {
                let _ = sender.send(decode(value));
            }),
        );
        Self {
            receiver,
            subscription: Subscription::new(lease, id),
            refresh: None,
        }
    }

    /// A feed that never yields. Returned when the client is unavailable.
    pub fn inert() -> Self {
        let (_, receiver) = mpsc::unbounded_channel();
        Self {
            receiver,
            subscription: Subscription::noop(),
            refresh: None,
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Feed<T> {
    /// Like [`Feed::open`], but the last snapshot is also re-decoded every
    /// `every`, and the result is delivered when it differs from the last
    /// item. Use this for decoders that depend on the current time, such as
    /// age filters, which must expire entries even when nothing is written.
    ///
    /// The feed still ends once its listener is gone.
    pub fn open_refreshed<F>(lease: &ClientLease, path: &DbPath, every: Duration, decode: F) -> Self
    where
        F: Fn(Option<JsonValue>) -> T + Send + Sync + 'static,
    {
        let decode = Arc::new(decode);
        let snapshot = Arc::new(Mutex::new(Snapshot {
            raw: None,
            delivered: None,
        }));
        let (sender, receiver) = mpsc::unbounded_channel();
        let weak_sender = sender.downgrade();

        let id = {
            let decode = decode.clone();
            let snapshot = snapshot.clone();
            lease.listen(
                path,
                Arc::new(move |value: Option<JsonValue>| {
                    let item = decode(value.clone());
                    let mut slot = snapshot.lock();
                    slot.raw = value;
                    slot.delivered = Some(item.clone());
                    let _ = sender.send(item);
                }),
            )
        };

        let refresh = Handle::try_current().ok().map(|handle| {
            RefreshTask(handle.spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    // The listener owns the only strong sender.
                    let Some(sender) = weak_sender.upgrade() else {
                        break;
                    };
                    let mut slot = snapshot.lock();
                    let item = decode(slot.raw.clone());
                    if slot.delivered.as_ref() == Some(&item) {
                        continue;
                    }
                    slot.delivered = Some(item.clone());
                    if sender.send(item).is_err() {
                        break;
                    }
                }
            }))
        });

        Self {
            receiver,
            subscription: Subscription::new(lease, id),
            refresh,
        }
    }
}

impl<T> Feed<T> {
    /// Wait for the next snapshot. `None` once the listener is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next snapshot if one is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drain the queue and return the most recent snapshot, if any.
    pub fn latest(&mut self) -> Option<T> {
        let mut latest = None;
        while let Ok(item) = self.receiver.try_recv() {
            latest = Some(item);
        }
        latest
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// True when the feed re-evaluates its last snapshot on a timer.
    pub fn is_refreshed(&self) -> bool {
        self.refresh.is_some()
    }

    pub fn unsubscribe(self) {
        drop(self.refresh);
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncClient;
    use realtime_transport::{MemoryBackend, Transport, Value};

    #[tokio::test]
    async fn feed_decodes_snapshots_and_unsubscribes_only_itself() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let client = SyncClient::new(transport.clone());
        let lease = client.acquire().unwrap();
        let path = DbPath::parse("typing/s1").unwrap();

        let mut mine = Feed::open(&lease, &path, |v| v.map_or(0, |v| v.as_object().map_or(0, |m| m.len())));
        let mut other = Feed::open(&lease, &path, |v| v.is_some());
        assert_eq!(mine.recv().await, Some(0));
        assert_eq!(other.recv().await, Some(false));

        transport
            .set(&path.child("ana"), Value::from(1i64))
            .await
            .unwrap();
        assert_eq!(mine.latest(), Some(1));

        mine.unsubscribe();
        assert_eq!(transport.listener_count(), 1);
        assert_eq!(other.try_recv(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_feed_re_evaluates_without_writes() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let client = SyncClient::new(transport.clone());
        let lease = client.acquire().unwrap();
        let path = DbPath::parse("typing/s1").unwrap();
        transport
            .set(&path.child("ana"), Value::from(1i64))
            .await
            .unwrap();

        let opened = tokio::time::Instant::now();
        let mut fresh = Feed::open_refreshed(&lease, &path, Duration::from_secs(1), move |v| {
            v.is_some() && opened.elapsed() < Duration::from_secs(5)
        });
        assert!(fresh.is_refreshed());
        assert_eq!(fresh.recv().await, Some(true));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fresh.try_recv(), None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fresh.latest(), Some(false));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fresh.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_feed_ends_with_its_listener() {
        let backend = MemoryBackend::new();
        let transport = backend.connect_client("frontdesk").unwrap();
        let client = SyncClient::new(transport.clone());
        let lease = client.acquire().unwrap();
        let path = DbPath::parse("presence/s1").unwrap();

        let mut feed = Feed::open_refreshed(&lease, &path, Duration::from_secs(1), |v| v.is_some());
        assert_eq!(feed.recv().await, Some(false));

        assert_eq!(transport.off_path(&path), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(feed.recv().await, None);
    }

    #[tokio::test]
    async fn inert_feed_ends_immediately() {
        let mut feed: Feed<u32> = Feed::inert();
        assert!(!feed.is_active());
        assert_eq!(feed.recv().await, None);
    }
}
