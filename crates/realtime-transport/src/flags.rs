//! Locally persisted connection-failure flags.
//!
//! A transport that loses its stream records a flag under a well-known
//! prefix. While any such flag exists, transports refuse to go back online
//! by themselves; only a nuclear reconnect clears them.

use crate::{TransportError, TransportResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix for flags written when a stream connection fails.
pub const STREAM_FAILURE_PREFIX: &str = "frontdesk:previous_stream_failure";
/// Prefix for flags written when an explicit connect attempt fails.
pub const CONNECT_FAILURE_PREFIX: &str = "frontdesk:previous_connect_failure";

/// Key/value storage for failure flags.
pub trait FlagStorage: Send + Sync {
    fn get(&self, key: &str) -> TransportResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> TransportResult<()>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> TransportResult<bool>;

    fn list_keys_with_prefix(&self, prefix: &str) -> TransportResult<Vec<String>>;
}

/// Flag key for a stream failure of the given app identity.
pub fn stream_failure_key(app_name: &str) -> String {
    format!("{STREAM_FAILURE_PREFIX}:{app_name}")
}

/// Record that `app_name` lost its connection.
pub fn record_connection_failure(storage: &dyn FlagStorage, app_name: &str) -> TransportResult<()> {
    storage.set(
        &stream_failure_key(app_name),
        &chrono::Utc::now().timestamp_millis().to_string(),
    )
}

/// True if any failure flag is present.
pub fn has_connection_failure(storage: &dyn FlagStorage) -> bool {
    [STREAM_FAILURE_PREFIX, CONNECT_FAILURE_PREFIX]
        .iter()
        .any(|prefix| {
            storage
                .list_keys_with_prefix(prefix)
                .map(|keys| !keys.is_empty())
                .unwrap_or(false)
        })
}

/// Remove every failure flag. Returns how many were removed.
pub fn clear_connection_failure_flags(storage: &dyn FlagStorage) -> TransportResult<usize> {
    let mut removed = 0;
    for prefix in [STREAM_FAILURE_PREFIX, CONNECT_FAILURE_PREFIX] {
        for key in storage.list_keys_with_prefix(prefix)? {
            if storage.delete(&key)? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// In-process flag storage.
#[derive(Default)]
pub struct MemoryFlagStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryFlagStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStorage for MemoryFlagStorage {
    fn get(&self, key: &str) -> TransportResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> TransportResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> TransportResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> TransportResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Flag storage backed by a JSON object on disk.
pub struct FileFlagStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileFlagStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> TransportResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(TransportError::FlagStorage(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write(&self, entries: &BTreeMap<String, String>) -> TransportResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::FlagStorage(format!("create {}: {e}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content).map_err(|e| {
            TransportError::FlagStorage(format!("write {}: {e}", self.path.display()))
        })
    }
}

impl FlagStorage for FileFlagStorage {
    fn get(&self, key: &str) -> TransportResult<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> TransportResult<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read()?;
        entries.insert(key.to_string(), value.to_string());
        self.write(&entries)
    }

    fn delete(&self, key: &str) -> TransportResult<bool> {
        let _guard = self.lock.lock();
        let mut entries = self.read()?;
        let existed = entries.remove(key).is_some();
        if existed {
            self.write(&entries)?;
        }
        Ok(existed)
    }

    fn list_keys_with_prefix(&self, prefix: &str) -> TransportResult<Vec<String>> {
        let _guard = self.lock.lock();
        Ok(self
            .read()?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(storage: &dyn FlagStorage) {
        assert!(!has_connection_failure(storage));

        record_connection_failure(storage, "frontdesk").unwrap();
        storage
            .set(&format!("{CONNECT_FAILURE_PREFIX}:frontdesk-reconnect-1"), "1")
            .unwrap();
        storage.set("unrelated", "keep").unwrap();
        assert!(has_connection_failure(storage));
        assert!(storage.get(&stream_failure_key("frontdesk")).unwrap().is_some());

        assert_eq!(clear_connection_failure_flags(storage).unwrap(), 2);
        assert!(!has_connection_failure(storage));
        assert_eq!(storage.get("unrelated").unwrap().as_deref(), Some("keep"));
        assert_eq!(clear_connection_failure_flags(storage).unwrap(), 0);
    }

    #[test]
    fn memory_storage_flags() {
        exercise(&MemoryFlagStorage::new());
    }

    #[test]
    fn file_storage_flags() {
        let dir = tempdir().unwrap();
        let storage = FileFlagStorage::new(dir.path().join("nested").join("flags.json"));
        exercise(&storage);
        assert!(storage.path().exists());
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flags.json");
        record_connection_failure(&FileFlagStorage::new(&path), "frontdesk").unwrap();

        let reopened = FileFlagStorage::new(&path);
        assert!(has_connection_failure(&reopened));
        assert!(!reopened.delete("missing").unwrap());
    }
}
