//! Connection monitor over the backend's `.info/connected` flag.

use crate::{ClientLease, SyncClient};
use parking_lot::Mutex;
use realtime_transport::{layout, ListenerId, Transport};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// Handle to a registered listener. Dropping it unregisters the listener
/// on the client it was registered with.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registration: Option<(Weak<dyn Transport>, ListenerId)>,
}

impl Subscription {
    /// A handle that owns nothing.
    pub fn noop() -> Self {
        Self { registration: None }
    }

    pub(crate) fn new(lease: &ClientLease, id: ListenerId) -> Self {
        Self {
            registration: Some((Arc::downgrade(lease.transport()), id)),
        }
    }

    /// True while the listener is registered on a live client.
    pub fn is_active(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|(transport, _)| transport.strong_count() > 0)
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some((transport, id)) = self.registration.take() {
            if let Some(transport) = transport.upgrade() {
                transport.unlisten(id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reports transitions of the connected flag.
#[derive(Clone)]
pub struct ConnectionMonitor {
    client: Arc<SyncClient>,
}

impl ConnectionMonitor {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }

    /// Deliver the current flag, then every transition. With no client the
    /// callback receives `false` once and the handle is a no-op.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let Some(lease) = self.client.current() else {
            callback(false);
            return Subscription::noop();
        };
        let id = lease.listen(
            &layout::info_connected(),
            Arc::new(move |value| {
                callback(value.and_then(|v| v.as_bool()).unwrap_or(false));
            }),
        );
        Subscription::new(&lease, id)
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .current()
            .is_some_and(|lease| lease.is_connected())
    }

    /// Resolve `true` once connected, or `false` when `timeout` elapses.
    /// The internal listener is removed either way.
    pub async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(move |connected| {
            if connected {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });
        let result = tokio::time::timeout(timeout, rx).await;
        drop(subscription);
        matches!(result, Ok(Ok(())))
    }
}
