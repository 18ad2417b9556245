//! Record store scenarios against the in-memory backend.
//!
//! - `atomic_patch.rs`  - single-read patches, id resolution, field races
//! - `staleness.rs`     - whole-session writes and the staleness guard
//! - `enrichment.rs`    - refinement merge and count mismatch
//! - `subscriptions.rs` - live feeds and listener isolation
//! - `degradation.rs`   - uninitialised, reconnecting and offline clients

mod atomic_patch;
mod subscriptions;

use crate::GuestRecordStore;
use realtime_transport::{layout, JsonValue, MemoryBackend, MemoryTransport};
use serde_json::json;
use std::sync::Arc;
use sync_client::SyncClient;

pub(crate) struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub transport: Arc<MemoryTransport>,
    pub client: Arc<SyncClient>,
    pub store: GuestRecordStore,
}

pub(crate) fn harness() -> Harness {
    let backend = MemoryBackend::new();
    let transport = backend.connect_client("frontdesk").unwrap();
    let client = SyncClient::new(transport.clone());
    Harness {
        store: GuestRecordStore::new(client.clone()),
        backend,
        transport,
        client,
    }
}

pub(crate) fn session_doc(last_modified: i64) -> JsonValue {
    json!({
        "id": "s1",
        "label": "Monday arrivals",
        "date": "2026-10-16",
        "lastModified": last_modified,
        "guests": [
            {"id": "a", "name": "Ada", "room": "101"},
            {"id": "b", "name": "Brian", "room": "102"}
        ]
    })
}

impl Harness {
    pub fn seed_session(&self, last_modified: i64) {
        self.backend
            .seed(&layout::session("s1"), session_doc(last_modified));
    }

    /// Another device sharing the same backend.
    pub fn other_device(&self, name: &str) -> Arc<MemoryTransport> {
        self.backend.connect_client(name).unwrap()
    }

    pub fn guests(&self) -> JsonValue {
        self.backend
            .snapshot(&layout::session_guests("s1"))
            .unwrap_or(JsonValue::Null)
    }
}
