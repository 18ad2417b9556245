//! Record store over the shared sync client.
//!
//! Field patches read the guest list exactly once with a single-shot read,
//! resolve the guest's current position by id, and write only the changed
//! fields plus the session timestamp in one multi-path update. They never
//! rewrite the whole list and never open a listener.

use crate::decode::{self, has_id, list_entries, next_index};
use crate::model::{CourtesyCall, Delivery, Guest, Session, SessionSummary};
use realtime_transport::{layout, sanitize, sanitize_batch, DbPath, JsonValue, Value, WriteBatch};
use std::sync::Arc;
use sync_client::{
    ClientLease, Feed, PatchOutcome, SkipReason, SyncClient, SyncError, SyncResult, WriteOutcome,
};
use tracing::{debug, info, warn};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Writes relative to one guest's location.
type GuestWrites = Vec<(DbPath, Value)>;

fn field(name: &str) -> DbPath {
    DbPath::root().child(name)
}

/// Guest list and session document access.
#[derive(Clone)]
pub struct GuestRecordStore {
    client: Arc<SyncClient>,
}

impl GuestRecordStore {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<SyncClient> {
        &self.client
    }

    /// Re-check the lease right before writing.
    fn still_current(&self, lease: &ClientLease, operation: &str) -> SyncResult<Option<SkipReason>> {
        match self.client.validate(lease) {
            Ok(()) => Ok(None),
            Err(e) => match e.skip_reason() {
                Some(reason) => {
                    warn!(operation, error = %e, "Client changed during operation, skipping write");
                    Ok(Some(reason))
                }
                None => Err(e),
            },
        }
    }

    // ------------------------------------------------------------------
    // Atomic field patches
    // ------------------------------------------------------------------

    async fn patch_guest<F>(
        &self,
        operation: &'static str,
        session_id: &str,
        guest_id: &str,
        build: F,
    ) -> SyncResult<PatchOutcome>
    where
        F: FnOnce(&JsonValue) -> SyncResult<GuestWrites> + Send,
    {
        let lease = match self.client.acquire_or_skip(operation) {
            Ok(lease) => lease,
            Err(reason) => return Ok(PatchOutcome::Skipped(reason)),
        };

        let guests_path = layout::session_guests(session_id);
        let guests = lease.get_once(&guests_path).await?;
        let entry = list_entries(guests.as_ref())
            .into_iter()
            .find(|e| has_id(&e.value, guest_id))
            .ok_or_else(|| {
                SyncError::NotFound(format!("guest {guest_id} in session {session_id}"))
            })?;
        let index = entry.index.ok_or_else(|| {
            SyncError::NotFound(format!(
                "guest {guest_id} has no list position (key {}) in session {session_id}",
                entry.key
            ))
        })?;

        let writes = build(&entry.value)?;
        let fields = writes.len();
        let guest_path = guests_path.child(index.to_string());
        let mut batch: WriteBatch = writes
            .into_iter()
            .map(|(relative, value)| (guest_path.join(&relative), value))
            .collect();
        batch.insert(layout::session_last_modified(session_id), Value::from(now_ms()));
        let batch = sanitize_batch(batch);

        if let Some(reason) = self.still_current(&lease, operation)? {
            return Ok(PatchOutcome::Skipped(reason));
        }
        lease.update(batch).await?;
        debug!(operation, session_id, guest_id, index, fields, "Guest patched");
        Ok(PatchOutcome::Applied { index, fields })
    }

    /// Write `fields` of one guest. Each key is a single field name.
    /// Absent values are written as deletions.
    pub async fn update_guest_fields<I, K>(
        &self,
        session_id: &str,
        guest_id: &str,
        fields: I,
    ) -> SyncResult<PatchOutcome>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let writes: GuestWrites = fields
            .into_iter()
            .map(|(name, value)| (field(name.as_ref()), value))
            .collect();
        self.patch_guest("update_guest_fields", session_id, guest_id, move |_| {
            Ok(writes)
        })
        .await
    }

    async fn set_status(
        &self,
        operation: &'static str,
        status_field: &str,
        session_id: &str,
        guest_id: &str,
        status: &str,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        let writes = vec![
            (field(status_field), Value::from(status)),
            (field("lastStatusUpdate"), Value::from(now_ms())),
            (field("lastStatusUpdatedBy"), Value::from(by)),
        ];
        self.patch_guest(operation, session_id, guest_id, move |_| Ok(writes))
            .await
    }

    /// Housekeeping status.
    pub async fn set_room_status(
        &self,
        session_id: &str,
        guest_id: &str,
        status: &str,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        self.set_status("set_room_status", "roomStatus", session_id, guest_id, status, by)
            .await
    }

    pub async fn set_maintenance_status(
        &self,
        session_id: &str,
        guest_id: &str,
        status: &str,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        self.set_status(
            "set_maintenance_status",
            "maintenanceStatus",
            session_id,
            guest_id,
            status,
            by,
        )
        .await
    }

    /// Front-of-house status.
    pub async fn set_guest_status(
        &self,
        session_id: &str,
        guest_id: &str,
        status: &str,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        self.set_status("set_guest_status", "guestStatus", session_id, guest_id, status, by)
            .await
    }

    /// Mark one delivery (found by id) delivered or pending again.
    pub async fn set_delivery_flag(
        &self,
        session_id: &str,
        guest_id: &str,
        delivery_id: &str,
        delivered: bool,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        let delivery_id = delivery_id.to_string();
        let by = by.to_string();
        self.patch_guest("set_delivery_flag", session_id, guest_id, move |guest| {
            let entry = list_entries(guest.get("deliveries"))
                .into_iter()
                .find(|e| has_id(&e.value, &delivery_id))
                .ok_or_else(|| SyncError::NotFound(format!("delivery {delivery_id}")))?;
            let base = field("deliveries").child(entry.key);
            let (at, who) = if delivered {
                (Value::from(now_ms()), Value::from(by))
            } else {
                (Value::Null, Value::Null)
            };
            Ok(vec![
                (base.child("delivered"), Value::from(delivered)),
                (base.child("deliveredAt"), at),
                (base.child("deliveredBy"), who),
            ])
        })
        .await
    }

    /// Append a delivery after the last stored one.
    pub async fn append_delivery(
        &self,
        session_id: &str,
        guest_id: &str,
        delivery: &Delivery,
    ) -> SyncResult<PatchOutcome> {
        let value = Value::from_serialize(delivery)?;
        self.patch_guest("append_delivery", session_id, guest_id, move |guest| {
            let slot = next_index(guest.get("deliveries"));
            Ok(vec![(field("deliveries").child(slot.to_string()), value)])
        })
        .await
    }

    /// Append a courtesy-call note stamped with the local clock.
    pub async fn append_courtesy_note(
        &self,
        session_id: &str,
        guest_id: &str,
        note: &str,
        by: &str,
    ) -> SyncResult<PatchOutcome> {
        let call = CourtesyCall {
            note: note.to_string(),
            by: Some(by.to_string()),
            at: Some(now_ms()),
            ..Default::default()
        };
        let value = Value::from_serialize(&call)?;
        self.patch_guest("append_courtesy_note", session_id, guest_id, move |guest| {
            let slot = next_index(guest.get("courtesyCalls"));
            Ok(vec![(field("courtesyCalls").child(slot.to_string()), value)])
        })
        .await
    }

    // ------------------------------------------------------------------
    // Whole documents
    // ------------------------------------------------------------------

    /// One-time read of a session. `None` when it does not exist or the
    /// client is unavailable.
    pub async fn fetch_session(&self, session_id: &str) -> SyncResult<Option<Session>> {
        let Ok(lease) = self.client.acquire_or_skip("fetch_session") else {
            return Ok(None);
        };
        let raw = lease.get_once(&layout::session(session_id)).await?;
        Ok(decode::decode_session(session_id, raw.as_ref()))
    }

    /// One-time read of every session summary, most recent first.
    pub async fn list_sessions(&self) -> SyncResult<Vec<SessionSummary>> {
        let Ok(lease) = self.client.acquire_or_skip("list_sessions") else {
            return Ok(Vec::new());
        };
        let raw = lease.get_once(&layout::sessions()).await?;
        Ok(decode::decode_index(raw.as_ref()))
    }

    /// Overwrite a whole session document.
    ///
    /// Unless `force` is set, the remote `lastModified` is read first and
    /// the write is skipped when it is strictly newer than the local one.
    /// This is last-write-wins at session granularity; concurrent field
    /// edits in between are overwritten.
    pub async fn sync_session(&self, session: &Session, force: bool) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip("sync_session") {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };

        if !force {
            let remote = lease
                .get_once(&layout::session_last_modified(&session.id))
                .await?
                .and_then(|v| v.as_i64());
            if let Some(remote) = remote.filter(|r| *r > session.last_modified) {
                info!(
                    session_id = %session.id,
                    local = session.last_modified,
                    remote,
                    "Remote session is newer, skipping write"
                );
                return Ok(WriteOutcome::SkippedStale {
                    local: session.last_modified,
                    remote,
                });
            }
        }

        let value = sanitize(Value::from_serialize(session)?);
        if let Some(reason) = self.still_current(&lease, "sync_session")? {
            return Ok(WriteOutcome::Skipped(reason));
        }
        lease.set(&layout::session(&session.id), value).await?;
        info!(
            session_id = %session.id,
            guests = session.guests.len(),
            force,
            "Session written"
        );
        Ok(WriteOutcome::Written)
    }

    pub async fn delete_session(&self, session_id: &str) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip("delete_session") {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };
        if let Some(reason) = self.still_current(&lease, "delete_session")? {
            return Ok(WriteOutcome::Skipped(reason));
        }
        lease.remove(&layout::session(session_id)).await?;
        info!(session_id, "Session deleted");
        Ok(WriteOutcome::Written)
    }

    // ------------------------------------------------------------------
    // Live subscriptions
    // ------------------------------------------------------------------

    /// Live guest list of one session. Missing data arrives as an empty list.
    pub fn subscribe_guests(&self, session_id: &str) -> Feed<Vec<Guest>> {
        match self.client.acquire_or_skip("subscribe_guests") {
            Ok(lease) => Feed::open(&lease, &layout::session_guests(session_id), |value| {
                decode::decode_guests(value.as_ref())
            }),
            Err(_) => Feed::inert(),
        }
    }

    /// Live session document, `None` while it does not exist.
    pub fn subscribe_session(&self, session_id: &str) -> Feed<Option<Session>> {
        match self.client.acquire_or_skip("subscribe_session") {
            Ok(lease) => {
                let id = session_id.to_string();
                Feed::open(&lease, &layout::session(session_id), move |value| {
                    decode::decode_session(&id, value.as_ref())
                })
            }
            Err(_) => Feed::inert(),
        }
    }

    /// Live index of every session, most recently modified first.
    pub fn subscribe_index(&self) -> Feed<Vec<SessionSummary>> {
        match self.client.acquire_or_skip("subscribe_index") {
            Ok(lease) => Feed::open(&lease, &layout::sessions(), |value| {
                decode::decode_index(value.as_ref())
            }),
            Err(_) => Feed::inert(),
        }
    }
}
