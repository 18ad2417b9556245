//! Normalisation of list-shaped data read from the store.
//!
//! A list written as an array is stored as an index-keyed map and may be
//! read back as either, depending on how sparse the keys are. Everything
//! past this module sees an ordered `Vec` only.

use crate::model::{Session, SessionSummary};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

/// One element of a stored list, with the storage key it lives under.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListEntry {
    pub key: String,
    /// Set when the key is a canonical list position.
    pub index: Option<usize>,
    pub value: JsonValue,
}

fn canonical_index(key: &str) -> Option<usize> {
    key.parse::<usize>()
        .ok()
        .filter(|n| n.to_string() == key)
}

/// Non-null elements of an array or keyed map in list order. Integer keys
/// sort numerically ahead of any other keys.
pub(crate) fn list_entries(value: Option<&JsonValue>) -> Vec<ListEntry> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| ListEntry {
                key: i.to_string(),
                index: Some(i),
                value: v.clone(),
            })
            .collect(),
        Some(JsonValue::Object(map)) => {
            let mut entries: Vec<ListEntry> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| ListEntry {
                    key: k.clone(),
                    index: canonical_index(k),
                    value: v.clone(),
                })
                .collect();
            entries.sort_by(|a, b| match (a.index, b.index) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.key.cmp(&b.key),
            });
            entries
        }
        _ => Vec::new(),
    }
}

/// Position an appended element should take.
pub(crate) fn next_index(value: Option<&JsonValue>) -> usize {
    match value {
        Some(JsonValue::Array(items)) => items.len(),
        other => list_entries(other)
            .iter()
            .filter_map(|e| e.index)
            .max()
            .map_or(0, |max| max + 1),
    }
}

/// True when the element's `id` field equals `id`. Numeric ids compare
/// by their decimal form.
pub(crate) fn has_id(value: &JsonValue, id: &str) -> bool {
    value.get("id").and_then(scalar_string).as_deref() == Some(id)
}

pub(crate) fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A stored object with typed fields and a catch-all `extra` map.
///
/// A field whose stored value does not fit its typed slot is kept verbatim
/// in `extra`, so decoding never loses data that a later whole-document
/// write would then delete.
pub trait Record: DeserializeOwned + Default {
    /// Whether `value` can be held by the typed field stored under `key`.
    /// Keys the record does not model always fit.
    fn fits(key: &str, value: &JsonValue) -> bool;

    fn extra_mut(&mut self) -> &mut Map<String, JsonValue>;
}

/// Shape checks for [`Record::fits`].
pub(crate) mod fits {
    use serde_json::Value as JsonValue;

    /// Anything a lenient string field turns into text.
    pub fn scalar(value: &JsonValue) -> bool {
        !value.is_array() && !value.is_object()
    }

    pub fn string(value: &JsonValue) -> bool {
        value.is_string()
    }

    pub fn optional_string(value: &JsonValue) -> bool {
        value.is_null() || value.is_string()
    }

    pub fn millis(value: &JsonValue) -> bool {
        value.is_i64()
    }

    pub fn optional_millis(value: &JsonValue) -> bool {
        value.is_null() || value.is_i64()
    }

    pub fn flag(value: &JsonValue) -> bool {
        value.is_boolean()
    }

    /// Array or keyed map.
    pub fn list(value: &JsonValue) -> bool {
        value.is_null() || value.is_array() || value.is_object()
    }
}

/// Decode one stored object into `T`. Misfit fields go to `extra`. An
/// object that still fails to decode is kept whole in `extra`. Only
/// non-object values are rejected.
pub fn decode_record<T: Record>(value: JsonValue) -> Result<T, serde_json::Error> {
    let JsonValue::Object(map) = value else {
        return serde_json::from_value(value);
    };
    let (typed, set_aside): (Map<String, JsonValue>, Map<String, JsonValue>) =
        map.clone().into_iter().partition(|(key, v)| T::fits(key, v));
    let mut record = match serde_json::from_value::<T>(JsonValue::Object(typed)) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "Record kept as raw fields");
            let mut raw = T::default();
            *raw.extra_mut() = map;
            return Ok(raw);
        }
    };
    record.extra_mut().extend(set_aside);
    Ok(record)
}

/// Decode every element of a stored list. Only elements that are not
/// objects at all are skipped.
pub fn decode_list<T: Record>(value: Option<&JsonValue>) -> Vec<T> {
    list_entries(value)
        .into_iter()
        .filter_map(|entry| match decode_record(entry.value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Skipping undecodable list element");
                None
            }
        })
        .collect()
}

pub fn decode_guests(value: Option<&JsonValue>) -> Vec<crate::Guest> {
    decode_list(value)
}

/// Decode the document at `sessions/{session_id}`. Missing or non-object
/// data is `None`.
pub fn decode_session(session_id: &str, value: Option<&JsonValue>) -> Option<Session> {
    let value = value.filter(|v| v.is_object())?;
    match decode_record::<Session>(value.clone()) {
        Ok(mut session) => {
            if session.id.is_empty() {
                session.id = session_id.to_string();
            }
            Some(session)
        }
        Err(e) => {
            warn!(session_id, error = %e, "Undecodable session document");
            None
        }
    }
}

/// Summaries of every session under `sessions/`, most recently modified
/// first.
pub fn decode_index(value: Option<&JsonValue>) -> Vec<SessionSummary> {
    let mut summaries: Vec<SessionSummary> = list_entries(value)
        .iter()
        .filter_map(|entry| decode_session(&entry.key, Some(&entry.value)))
        .map(|session| session.summary())
        .collect();
    summaries.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.id.cmp(&b.id))
    });
    summaries
}

pub(crate) fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Record,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(decode_list(raw.as_ref()))
}

pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(scalar_string).unwrap_or_default())
}
