//! Write sanitizer.
//!
//! Replaces every [`Value::Absent`] marker, at any depth, with an explicit
//! null so the backing store accepts the write. Lists keep their length,
//! maps keep their keys, and every other value passes through unchanged.

use crate::{Value, WriteBatch};

/// Recursively replace absent markers with null.
///
/// Idempotent: `sanitize(sanitize(v)) == sanitize(v)`.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Absent => Value::Null,
        Value::List(items) => Value::List(items.into_iter().map(sanitize).collect()),
        Value::Map(entries) => {
            Value::Map(entries.into_iter().map(|(k, v)| (k, sanitize(v))).collect())
        }
        other => other,
    }
}

/// Sanitize every value of a multi-path batch.
pub fn sanitize_batch(batch: WriteBatch) -> WriteBatch {
    batch.into_iter().map(|(path, v)| (path, sanitize(v))).collect()
}
