//! The explicit realtime client context.
//!
//! One `SyncClient` is shared by every store. It owns the current transport
//! handle, a generation counter bumped each time the handle is replaced,
//! and the "reconnecting" gate. Stores take a [`ClientLease`] per operation
//! and re-validate it before writing, so work started against a handle that
//! was since replaced is rejected rather than written through a dead client.

use crate::{SkipReason, SyncError, SyncResult};
use parking_lot::RwLock;
use realtime_transport::{Transport, TransportFactory};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A transport handle tagged with the generation it was taken at.
#[derive(Clone)]
pub struct ClientLease {
    transport: Arc<dyn Transport>,
    generation: u64,
}

impl ClientLease {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ClientLease {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport.as_ref()
    }
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("app_name", &self.transport.app_name())
            .field("generation", &self.generation)
            .finish()
    }
}

struct Slot {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
}

/// Holds the reconnecting gate while alive; dropping it opens the gate.
pub struct ReconnectGuard {
    client: Arc<SyncClient>,
}

impl Drop for ReconnectGuard {
    fn drop(&mut self) {
        self.client.reconnecting.store(false, Ordering::SeqCst);
    }
}

/// Process-wide realtime client context.
pub struct SyncClient {
    base_app_name: String,
    slot: RwLock<Slot>,
    reconnecting: AtomicBool,
}

impl SyncClient {
    /// Context around an already-connected transport (generation 1).
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            base_app_name: transport.app_name().to_string(),
            slot: RwLock::new(Slot {
                transport: Some(transport),
                generation: 1,
            }),
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Context with no transport. Every store call degrades to a no-op
    /// until a reconnect installs one.
    pub fn uninitialized(base_app_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base_app_name: base_app_name.into(),
            slot: RwLock::new(Slot {
                transport: None,
                generation: 0,
            }),
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Connect through `factory` under `app_name`.
    pub async fn connect(factory: &dyn TransportFactory, app_name: &str) -> SyncResult<Arc<Self>> {
        let transport = factory.connect(app_name).await?;
        info!(app_name, "Realtime client created");
        Ok(Self::new(transport))
    }

    /// Identity the first client registered under; reconnect identities
    /// are derived from it.
    pub fn base_app_name(&self) -> &str {
        &self.base_app_name
    }

    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.read().transport.is_some()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Current handle, ignoring the reconnecting gate. Used by the
    /// connection monitor and the reconnect tiers themselves.
    pub fn current(&self) -> Option<ClientLease> {
        let slot = self.slot.read();
        slot.transport.as_ref().map(|transport| ClientLease {
            transport: transport.clone(),
            generation: slot.generation,
        })
    }

    /// Handle for a store operation.
    pub fn acquire(&self) -> SyncResult<ClientLease> {
        if self.is_reconnecting() {
            return Err(SyncError::ReconnectInProgress);
        }
        self.current().ok_or(SyncError::NotInitialized)
    }

    /// Like [`SyncClient::acquire`], logging and returning the skip reason
    /// when the client is unavailable.
    pub fn acquire_or_skip(&self, operation: &str) -> Result<ClientLease, SkipReason> {
        self.acquire().map_err(|e| {
            let reason = e.skip_reason().unwrap_or(SkipReason::NotInitialized);
            warn!(operation, reason = %reason, "Realtime client unavailable, skipping");
            reason
        })
    }

    /// Check that `lease` is still the live handle and no reconnect started.
    pub fn validate(&self, lease: &ClientLease) -> SyncResult<()> {
        if self.is_reconnecting() {
            return Err(SyncError::ReconnectInProgress);
        }
        let current = self.generation();
        if current != lease.generation {
            return Err(SyncError::StaleHandle {
                held: lease.generation,
                current,
            });
        }
        Ok(())
    }

    /// Close the reconnecting gate. Returns `None` if it is already closed.
    pub fn try_begin_reconnect(self: &Arc<Self>) -> Option<ReconnectGuard> {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ReconnectGuard {
                client: self.clone(),
            })
    }

    /// Remove the current handle. The generation is unchanged until a new
    /// handle is installed.
    pub(crate) fn discard(&self) -> Option<Arc<dyn Transport>> {
        self.slot.write().transport.take()
    }

    /// Install a new handle and bump the generation.
    pub(crate) fn install(&self, transport: Arc<dyn Transport>) -> u64 {
        let mut slot = self.slot.write();
        slot.transport = Some(transport);
        slot.generation += 1;
        slot.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_transport::MemoryBackend;

    #[tokio::test]
    async fn uninitialized_client_reports_not_initialized() {
        let client = SyncClient::uninitialized("frontdesk");
        assert!(!client.is_initialized());
        assert!(matches!(client.acquire(), Err(SyncError::NotInitialized)));
        assert_eq!(
            client.acquire_or_skip("test").unwrap_err(),
            SkipReason::NotInitialized
        );
    }

    #[tokio::test]
    async fn reconnect_gate_blocks_acquire_until_dropped() {
        let backend = MemoryBackend::new();
        let client = SyncClient::connect(backend.as_ref(), "frontdesk").await.unwrap();

        let guard = client.try_begin_reconnect().unwrap();
        assert!(client.try_begin_reconnect().is_none());
        assert!(matches!(
            client.acquire(),
            Err(SyncError::ReconnectInProgress)
        ));
        assert!(client.current().is_some());

        drop(guard);
        assert!(client.acquire().is_ok());
    }

    #[tokio::test]
    async fn replaced_handle_is_stale() {
        let backend = MemoryBackend::new();
        let client = SyncClient::connect(backend.as_ref(), "frontdesk").await.unwrap();
        let lease = client.acquire().unwrap();
        assert_eq!(lease.generation(), 1);
        assert!(client.validate(&lease).is_ok());

        client.discard();
        let replacement = backend.connect_client("frontdesk-reconnect-1").unwrap();
        assert_eq!(client.install(replacement), 2);

        assert!(matches!(
            client.validate(&lease),
            Err(SyncError::StaleHandle { held: 1, current: 2 })
        ));
        assert_eq!(client.acquire().unwrap().app_name(), "frontdesk-reconnect-1");
        assert_eq!(client.base_app_name(), "frontdesk");
    }
}
