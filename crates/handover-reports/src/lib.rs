//! Shift handover reports at `handovers/{date}/{department}`.
//!
//! A report carries an AM and a PM half. Locking the AM half writes only
//! `amLockedAt`/`amLockedBy`; editors check [`HandoverReport::am_editable`]
//! before changing AM fields.

use realtime_transport::{layout, sanitize, JsonValue, Value, WriteBatch};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;
use sync_client::{Feed, SyncClient, SyncResult, WriteOutcome};
use tracing::{info, warn};

/// One half-day of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftReport {
    /// Department-specific structured fields.
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoverReport {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub am: Option<ShiftReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm: Option<ShiftReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub am_locked_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub am_locked_by: Option<String>,
    /// Server time of the last save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl HandoverReport {
    pub fn new(date: impl Into<String>, department: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            department: department.into(),
            ..Default::default()
        }
    }

    /// False once the AM half is locked.
    pub fn am_editable(&self) -> bool {
        self.am_locked_at.is_none()
    }
}

fn decode_report(date: &str, department: &str, value: JsonValue) -> Option<HandoverReport> {
    match serde_json::from_value::<HandoverReport>(value) {
        Ok(mut report) => {
            if report.date.is_empty() {
                report.date = date.to_string();
            }
            if report.department.is_empty() {
                report.department = department.to_string();
            }
            Some(report)
        }
        Err(e) => {
            warn!(date, department, error = %e, "Undecodable handover report");
            None
        }
    }
}

/// Reports of one date, ordered by department.
fn decode_date(date: &str, value: Option<JsonValue>) -> Vec<HandoverReport> {
    let Some(JsonValue::Object(departments)) = value else {
        return Vec::new();
    };
    let mut reports: Vec<HandoverReport> = departments
        .into_iter()
        .filter(|(_, v)| v.is_object())
        .filter_map(|(department, v)| decode_report(date, &department, v))
        .collect();
    reports.sort_by(|a, b| a.department.cmp(&b.department));
    reports
}

#[derive(Clone)]
pub struct HandoverStore {
    client: Arc<SyncClient>,
}

impl HandoverStore {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }

    /// Replace the whole report, stamping `lastUpdated` with server time.
    pub async fn save(&self, report: &HandoverReport) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip("handover_save") {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };
        let mut value = Value::from_serialize(report)?;
        if let Value::Map(entries) = &mut value {
            entries.insert("lastUpdated".to_string(), Value::ServerTimestamp);
        }
        lease
            .set(
                &layout::handover(&report.date, &report.department),
                sanitize(value),
            )
            .await?;
        info!(date = %report.date, department = %report.department, "Handover saved");
        Ok(WriteOutcome::Written)
    }

    async fn write_lock(
        &self,
        operation: &'static str,
        date: &str,
        department: &str,
        locked_at: Value,
        locked_by: Value,
    ) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip(operation) {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };
        let report = layout::handover(date, department);
        let mut batch = WriteBatch::new();
        batch.insert(report.child("amLockedAt"), locked_at);
        batch.insert(report.child("amLockedBy"), locked_by);
        lease.update(batch).await?;
        info!(date, department, operation, "Handover AM lock changed");
        Ok(WriteOutcome::Written)
    }

    /// Lock the AM half. Touches only the lock fields.
    pub async fn lock_am(&self, date: &str, department: &str, by: &str) -> SyncResult<WriteOutcome> {
        self.write_lock(
            "handover_lock_am",
            date,
            department,
            Value::ServerTimestamp,
            Value::from(by),
        )
        .await
    }

    pub async fn unlock_am(&self, date: &str, department: &str) -> SyncResult<WriteOutcome> {
        self.write_lock("handover_unlock_am", date, department, Value::Null, Value::Null)
            .await
    }

    pub async fn fetch(&self, date: &str, department: &str) -> SyncResult<Option<HandoverReport>> {
        let Ok(lease) = self.client.acquire_or_skip("handover_fetch") else {
            return Ok(None);
        };
        let raw = lease.get_once(&layout::handover(date, department)).await?;
        Ok(raw
            .filter(JsonValue::is_object)
            .and_then(|v| decode_report(date, department, v)))
    }

    pub async fn fetch_all_for_date(&self, date: &str) -> SyncResult<Vec<HandoverReport>> {
        let Ok(lease) = self.client.acquire_or_skip("handover_fetch_date") else {
            return Ok(Vec::new());
        };
        let raw = lease.get_once(&layout::handovers_for_date(date)).await?;
        Ok(decode_date(date, raw))
    }

    pub fn subscribe_date(&self, date: &str) -> Feed<Vec<HandoverReport>> {
        let Ok(lease) = self.client.acquire_or_skip("handover_subscribe") else {
            return Feed::inert();
        };
        let owned = date.to_string();
        Feed::open(&lease, &layout::handovers_for_date(date), move |value| {
            decode_date(&owned, value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_transport::MemoryBackend;
    use serde_json::json;
    use sync_client::SkipReason;

    const DATE: &str = "2026-10-16";

    fn store() -> (Arc<MemoryBackend>, HandoverStore) {
        let backend = MemoryBackend::new();
        backend.freeze_server_time(1_000);
        let client = SyncClient::new(backend.connect_client("frontdesk").unwrap());
        (backend, HandoverStore::new(client))
    }

    fn housekeeping() -> HandoverReport {
        let mut report = HandoverReport::new(DATE, "housekeeping");
        report.am = Some(ShiftReport {
            fields: json!({"roomsCleaned": 42, "outOfOrder": ["104"]})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            notes: "Linen short".into(),
            author: Some("Ana".into()),
            completed_at: Some(900),
        });
        report
    }

    #[tokio::test]
    async fn save_stamps_server_time_and_fetches_back() {
        let (_, store) = store();
        assert!(store.save(&housekeeping()).await.unwrap().is_written());

        let fetched = store.fetch(DATE, "housekeeping").await.unwrap().unwrap();
        assert_eq!(fetched.last_updated, Some(1_000));
        assert_eq!(fetched.am, housekeeping().am);
        assert!(fetched.am_editable());
        assert_eq!(store.fetch(DATE, "maintenance").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_touches_only_lock_fields() {
        let (backend, store) = store();
        store.save(&housekeeping()).await.unwrap();
        let am_before = backend.snapshot(&layout::handover(DATE, "housekeeping").child("am"));

        store.lock_am(DATE, "housekeeping", "Bo").await.unwrap();
        let locked = store.fetch(DATE, "housekeeping").await.unwrap().unwrap();
        assert_eq!(locked.am_locked_at, Some(1_000));
        assert_eq!(locked.am_locked_by.as_deref(), Some("Bo"));
        assert!(!locked.am_editable());
        assert_eq!(
            backend.snapshot(&layout::handover(DATE, "housekeeping").child("am")),
            am_before
        );

        store.unlock_am(DATE, "housekeeping").await.unwrap();
        let unlocked = store.fetch(DATE, "housekeeping").await.unwrap().unwrap();
        assert!(unlocked.am_editable());
        assert_eq!(unlocked.am_locked_by, None);
    }

    #[tokio::test]
    async fn date_listing_and_subscription() {
        let (_, store) = store();
        let mut feed = store.subscribe_date(DATE);
        assert!(feed.recv().await.unwrap().is_empty());

        store.save(&housekeeping()).await.unwrap();
        store
            .save(&HandoverReport::new(DATE, "frontdesk"))
            .await
            .unwrap();

        let all = store.fetch_all_for_date(DATE).await.unwrap();
        let departments: Vec<_> = all.iter().map(|r| r.department.as_str()).collect();
        assert_eq!(departments, ["frontdesk", "housekeeping"]);
        assert_eq!(feed.latest().unwrap(), all);
    }

    #[tokio::test]
    async fn uninitialised_store_skips() {
        let store = HandoverStore::new(SyncClient::uninitialized("frontdesk"));
        assert_eq!(
            store.lock_am(DATE, "housekeeping", "Bo").await.unwrap(),
            WriteOutcome::Skipped(SkipReason::NotInitialized)
        );
        assert!(store.fetch_all_for_date(DATE).await.unwrap().is_empty());
        assert!(!store.subscribe_date(DATE).is_active());
    }
}
