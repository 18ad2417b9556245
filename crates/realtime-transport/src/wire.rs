//! Tree storage shape shared by the transports.
//!
//! Stored trees are canonical: objects only, no nulls, no empty objects.
//! Arrays written by a client are stored as objects keyed by index. On
//! read, an object whose keys are all non-negative integers, with the
//! largest key below twice the number of keys, is returned as an array
//! with null in the gaps. Every reader therefore has to accept both shapes
//! for list-like data.

use crate::DbPath;
use serde_json::{Map, Value as JsonValue};

/// Canonical stored form of a value, or `None` if it stores nothing.
pub fn canonicalize(value: JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Array(items) => {
            let map: Map<String, JsonValue> = items
                .into_iter()
                .enumerate()
                .filter_map(|(i, v)| canonicalize(v).map(|v| (i.to_string(), v)))
                .collect();
            (!map.is_empty()).then_some(JsonValue::Object(map))
        }
        JsonValue::Object(map) => {
            let map: Map<String, JsonValue> = map
                .into_iter()
                .filter_map(|(k, v)| canonicalize(v).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(JsonValue::Object(map))
        }
        scalar => Some(scalar),
    }
}

/// Read shape of a stored value (array heuristic applied recursively).
pub fn read_shape(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            if let Some(items) = as_array(map) {
                return JsonValue::Array(items);
            }
            JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), read_shape(v))).collect())
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(read_shape).collect()),
        scalar => scalar.clone(),
    }
}

fn as_array(map: &Map<String, JsonValue>) -> Option<Vec<JsonValue>> {
    if map.is_empty() {
        return None;
    }
    let mut max_index = 0usize;
    for key in map.keys() {
        // "01" is a key, not an index.
        if key.len() > 1 && key.starts_with('0') {
            return None;
        }
        let index: usize = key.parse().ok()?;
        max_index = max_index.max(index);
    }
    if max_index >= map.len() * 2 {
        return None;
    }
    let mut items = vec![JsonValue::Null; max_index + 1];
    for (key, value) in map {
        if let Ok(index) = key.parse::<usize>() {
            items[index] = read_shape(value);
        }
    }
    Some(items)
}

/// Stored value at `path`, without the read shape applied.
pub fn lookup<'a>(root: &'a JsonValue, path: &DbPath) -> Option<&'a JsonValue> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Value at `path` in read shape, `None` if nothing is stored there.
pub fn read_at(root: &JsonValue, path: &DbPath) -> Option<JsonValue> {
    lookup(root, path).map(read_shape)
}

/// Store `value` at `path`. `None` or null removes the location, and
/// parents left empty are pruned.
pub fn write_at(root: &mut JsonValue, path: &DbPath, value: Option<JsonValue>) {
    let value = value.and_then(canonicalize);
    if path.is_root() {
        *root = value.unwrap_or_else(|| JsonValue::Object(Map::new()));
        return;
    }
    if !root.is_object() {
        *root = JsonValue::Object(Map::new());
    }
    write_segments(root, path.segments(), value);
}

fn write_segments(node: &mut JsonValue, segments: &[String], value: Option<JsonValue>) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(map) = node.as_object_mut() else {
        return;
    };

    if rest.is_empty() {
        match value {
            Some(v) => {
                map.insert(head.clone(), v);
            }
            None => {
                map.remove(head);
            }
        }
        return;
    }

    if value.is_none() && !map.get(head).is_some_and(JsonValue::is_object) {
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| JsonValue::Object(Map::new()));
    if !child.is_object() {
        *child = JsonValue::Object(Map::new());
    }
    write_segments(child, rest, value);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(head);
    }
}

/// Apply a shallow merge: each child of `children` is written under `path`.
pub fn merge_at(root: &mut JsonValue, path: &DbPath, children: Map<String, JsonValue>) {
    for (key, value) in children {
        write_at(root, &path.child(key), Some(value));
    }
}
