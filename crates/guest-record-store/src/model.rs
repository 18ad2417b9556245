//! Session and guest records.
//!
//! Hotel-domain fields the sync layer does not interpret (car, adults,
//! package, deposit...) ride along in each record's `extra` map and are
//! written back unchanged. So does a modelled field whose stored value has
//! an unexpected type: it is set aside in `extra` (see [`Record`]). `extra`
//! is declared last so that, when serialized to a value, the set-aside raw
//! value replaces the typed field's default.

use crate::decode::{fits, lenient_list, lenient_string, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// One day's arrivals manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Also the path segment under `sessions/`.
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Calendar date, `YYYY-MM-DD`.
    #[serde(default)]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_list")]
    pub guests: Vec<Guest>,
    /// Epoch milliseconds. Compared by the staleness guard.
    #[serde(default)]
    pub last_modified: i64,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Record for Session {
    fn fits(key: &str, value: &JsonValue) -> bool {
        match key {
            "id" => fits::scalar(value),
            "label" | "date" => fits::string(value),
            "guests" => fits::list(value),
            "lastModified" => fits::millis(value),
            _ => true,
        }
    }

    fn extra_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.extra
    }
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            date: self.date.clone(),
            guest_count: self.guests.len(),
            last_modified: self.last_modified,
        }
    }

    pub fn guest(&self, guest_id: &str) -> Option<&Guest> {
        self.guests.iter().find(|g| g.id == guest_id)
    }
}

/// One row of a session's guest list. Its position is not an identity;
/// only `id` is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "lenient_string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Housekeeping status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_status: Option<String>,
    /// Front-of-house status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_status: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub deliveries: Vec<Delivery>,
    #[serde(
        default,
        deserialize_with = "lenient_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub courtesy_calls: Vec<CourtesyCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_update: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Record for Guest {
    fn fits(key: &str, value: &JsonValue) -> bool {
        match key {
            "id" | "name" | "room" => fits::scalar(value),
            "notes" | "roomStatus" | "maintenanceStatus" | "guestStatus"
            | "lastStatusUpdatedBy" => fits::optional_string(value),
            "lastStatusUpdate" => fits::optional_millis(value),
            "deliveries" | "courtesyCalls" => fits::list(value),
            _ => true,
        }
    }

    fn extra_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.extra
    }
}

impl Guest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn delivery(&self, delivery_id: &str) -> Option<&Delivery> {
        self.deliveries.iter().find(|d| d.id == delivery_id)
    }
}

/// A parcel or item held for the guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub item: String,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Record for Delivery {
    fn fits(key: &str, value: &JsonValue) -> bool {
        match key {
            "id" => fits::scalar(value),
            "item" => fits::string(value),
            "delivered" => fits::flag(value),
            "deliveredAt" => fits::optional_millis(value),
            "deliveredBy" => fits::optional_string(value),
            _ => true,
        }
    }

    fn extra_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.extra
    }
}

impl Delivery {
    pub fn new(id: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item: item.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourtesyCall {
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Record for CourtesyCall {
    fn fits(key: &str, value: &JsonValue) -> bool {
        match key {
            "note" => fits::string(value),
            "by" => fits::optional_string(value),
            "at" => fits::optional_millis(value),
            _ => true,
        }
    }

    fn extra_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.extra
    }
}

/// Lightweight index entry for the all-sessions view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub label: String,
    pub date: String,
    pub guest_count: usize,
    pub last_modified: i64,
}

fn lenient_string_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(crate::decode::scalar_string))
}
