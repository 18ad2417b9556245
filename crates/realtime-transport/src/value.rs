//! Dynamic values written to the document tree.
//!
//! `Value` is a superset of JSON with two extra variants:
//!
//! - [`Value::Absent`], the "no value given" marker for an optional field
//!   that was never set. The backing store rejects any write that still
//!   contains one, so every write goes through [`crate::sanitize`] first.
//! - [`Value::ServerTimestamp`], a placeholder resolved by the backend to
//!   its own clock at write time.

use crate::{TransportError, TransportResult};
use serde::Serialize;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeMap;

/// A value destined for the document tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value was supplied. Not representable on the wire.
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Resolved to the backend's clock (epoch milliseconds) on write.
    ServerTimestamp,
}

impl Value {
    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert any serializable type into a value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> TransportResult<Self> {
        Ok(serde_json::to_value(value)?.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    /// True if an [`Value::Absent`] marker appears anywhere in the value.
    pub fn contains_absent(&self) -> bool {
        match self {
            Value::Absent => true,
            Value::List(items) => items.iter().any(Value::contains_absent),
            Value::Map(entries) => entries.values().any(Value::contains_absent),
            _ => false,
        }
    }

    /// Wire form of the value. `server_timestamp` is substituted for every
    /// [`Value::ServerTimestamp`]; an absent marker is rejected.
    pub fn to_wire(&self, server_timestamp: &JsonValue) -> TransportResult<JsonValue> {
        Ok(match self {
            Value::Absent => {
                return Err(TransportError::Rejected(
                    "value contains an absent marker".to_string(),
                ))
            }
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| item.to_wire(server_timestamp))
                    .collect::<TransportResult<Vec<_>>>()?,
            ),
            Value::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_wire(server_timestamp)?);
                }
                JsonValue::Object(map)
            }
            Value::ServerTimestamp => server_timestamp.clone(),
        })
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no wire form and become null.
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Absent, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}
