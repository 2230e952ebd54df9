use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::ErrorKind;

pub mod keys {
    pub const COLLECTED: &str = "stamp_rally.collected";
    pub const COMPLETED: &str = "stamp_rally.completed";
    pub const AUTO_IDENTITY: &str = "stamp_rally.auto_identity";
    pub const IDENTITY: &str = "stamp_rally.identity";
    pub const JUST_RESET: &str = "stamp_rally.just_reset";
    pub const BACKUP: &str = "stamp_rally.backup";
    pub const DIAGNOSTICS: &str = "stamp_rally.diagnostics";
    pub const HEALTH_PROBE: &str = "stamp_rally.health_probe";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read {key}: {reason}")]
    Read { key: String, reason: String },
    #[error("failed to write {key}: {reason}")]
    Write { key: String, reason: String },
    #[error("stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::LocalStorageFailed
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

#[derive(Clone)]
pub struct SafeStorage {
    store: Arc<dyn KeyValueStore>,
}

impl SafeStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn read_string(&self, key: &str) -> StorageResult<Option<String>> {
        self.store.get(key)
    }

    pub fn write_string(&self, key: &str, value: &str) -> StorageResult<()> {
        self.store.set(key, value)
    }

    pub fn remove(&self, key: &str) -> StorageResult<()> {
        self.store.remove(key)
    }

    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str::<T>(&raw)
            .map(Some)
            .map_err(|error| StorageError::Corrupt {
                key: key.to_string(),
                reason: error.to_string(),
            })
    }

    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let payload = serde_json::to_string(value).map_err(|error| StorageError::Write {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        self.store.set(key, &payload)
    }

    pub fn read_flag(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .store
            .get(key)?
            .map(|value| value.trim() == "true")
            .unwrap_or(false))
    }

    pub fn write_flag(&self, key: &str, value: bool) -> StorageResult<()> {
        self.store.set(key, if value { "true" } else { "false" })
    }
}

pub fn default_store_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("stamp-rally").join("local_storage.json")
}

pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> StorageResult<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|error| {
                StorageError::Unavailable(format!(
                    "storage file {} is unreadable: {error}",
                    self.path.display()
                ))
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(StorageError::Unavailable(error.to_string())),
        }
    }

    fn write_map(&self, key: &str, map: &BTreeMap<String, String>) -> StorageResult<()> {
        let write_error = |reason: String| StorageError::Write {
            key: key.to_string(),
            reason,
        };
        let parent = self
            .path
            .parent()
            .ok_or_else(|| write_error("storage path has no parent directory".to_string()))?;
        fs::create_dir_all(parent).map_err(|error| write_error(error.to_string()))?;
        let payload =
            serde_json::to_string_pretty(map).map_err(|error| write_error(error.to_string()))?;
        fs::write(&self.path, payload).map_err(|error| write_error(error.to_string()))
    }

    fn guard(&self) -> StorageResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| StorageError::Unavailable("failed to acquire storage lock".to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.guard()?;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(key, &map)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.guard()?;
        let mut map = self.read_map()?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        self.write_map(key, &map)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn entries(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("failed to acquire memory store".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> (Arc<MemoryStore>, SafeStorage) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SafeStorage::new(store))
    }

    #[test]
    fn json_values_round_trip() {
        let (_, storage) = memory();
        storage
            .write_json(keys::COLLECTED, &vec![3_u32, 1, 2])
            .expect("write should succeed");
        let loaded = storage
            .read_json::<Vec<u32>>(keys::COLLECTED)
            .expect("read should succeed");
        assert_eq!(loaded, Some(vec![3, 1, 2]));
    }

    #[test]
    fn malformed_json_is_reported_as_corrupt() {
        let (store, storage) = memory();
        store.insert_raw(keys::COLLECTED, "[1, 2,");
        let error = storage
            .read_json::<Vec<u32>>(keys::COLLECTED)
            .expect_err("corrupt value should fail");
        assert!(error.is_corrupt());
        assert_eq!(error.kind(), ErrorKind::LocalStorageFailed);
    }

    #[test]
    fn failed_writes_surface_as_values() {
        let (store, storage) = memory();
        store.set_fail_writes(true);
        let error = storage
            .write_flag(keys::COMPLETED, true)
            .expect_err("write should fail");
        assert!(matches!(error, StorageError::Write { .. }));
        assert!(!storage.read_flag(keys::COMPLETED).expect("read should work"));
    }

    #[test]
    fn missing_flags_read_as_false() {
        let (_, storage) = memory();
        assert!(!storage.read_flag(keys::JUST_RESET).expect("read should work"));
        storage
            .write_flag(keys::JUST_RESET, true)
            .expect("write should succeed");
        assert!(storage.read_flag(keys::JUST_RESET).expect("read should work"));
    }

    #[test]
    fn file_store_persists_between_instances() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("local_storage.json");

        let first = FileStore::new(path.clone());
        first.set("alpha", "1").expect("set should succeed");
        first.set("beta", "2").expect("set should succeed");
        first.remove("alpha").expect("remove should succeed");

        let second = FileStore::new(path);
        assert_eq!(second.get("alpha").expect("get should work"), None);
        assert_eq!(
            second.get("beta").expect("get should work"),
            Some("2".to_string())
        );
    }

    #[test]
    fn file_store_reports_unreadable_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("local_storage.json");
        fs::write(&path, "not json").expect("fixture should write");

        let store = FileStore::new(path);
        assert!(matches!(
            store.get("alpha"),
            Err(StorageError::Unavailable(_))
        ));
    }
}
