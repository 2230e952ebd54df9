use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::storage::{keys, SafeStorage, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateBackup {
    pub stamps: Vec<u32>,
    pub is_complete: bool,
    pub timestamp_unix_ms: u128,
}

impl StateBackup {
    pub fn age_ms(&self, now_unix_ms: u128) -> u128 {
        now_unix_ms.saturating_sub(self.timestamp_unix_ms)
    }

    pub fn is_fresh(&self, now_unix_ms: u128, max_age: Duration) -> bool {
        self.timestamp_unix_ms <= now_unix_ms && self.age_ms(now_unix_ms) <= max_age.as_millis()
    }
}

pub fn save(
    storage: &SafeStorage,
    stamps: &[u32],
    is_complete: bool,
    now_unix_ms: u128,
) -> StorageResult<StateBackup> {
    let backup = StateBackup {
        stamps: stamps.to_vec(),
        is_complete,
        timestamp_unix_ms: now_unix_ms,
    };
    storage.write_json(keys::BACKUP, &backup)?;
    Ok(backup)
}

pub fn load(storage: &SafeStorage) -> Option<StateBackup> {
    storage.read_json::<StateBackup>(keys::BACKUP).ok().flatten()
}

pub fn load_fresh(
    storage: &SafeStorage,
    now_unix_ms: u128,
    max_age: Duration,
) -> Option<StateBackup> {
    load(storage).filter(|backup| backup.is_fresh(now_unix_ms, max_age))
}

pub fn clear(storage: &SafeStorage) -> StorageResult<()> {
    storage.remove(keys::BACKUP)
}

pub fn current_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
