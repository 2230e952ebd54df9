use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::backup::current_unix_ms;
use crate::error::ErrorKind;
use crate::storage::{keys, SafeStorage};

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp_unix_ms: u128,
}

pub struct Diagnostics {
    capacity: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
    storage: Option<SafeStorage>,
}

impl Diagnostics {
    pub fn new(capacity: usize, storage: Option<SafeStorage>) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            storage,
        }
    }

    pub fn load(capacity: usize, storage: SafeStorage) -> Self {
        let mut records = storage
            .read_json::<Vec<ErrorRecord>>(keys::DIAGNOSTICS)
            .ok()
            .flatten()
            .unwrap_or_default();
        let capacity = capacity.max(1);
        if records.len() > capacity {
            records.drain(..records.len() - capacity);
        }

        Self {
            capacity,
            records: Mutex::new(records.into()),
            storage: Some(storage),
        }
    }

    pub fn record(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            kind,
            message: message.into(),
            detail,
            timestamp_unix_ms: current_unix_ms(),
        };

        if kind.is_user_visible() {
            tracing::warn!(kind = kind.as_label(), detail = ?record.detail, "{}", record.message);
        } else {
            tracing::debug!(kind = kind.as_label(), detail = ?record.detail, "{}", record.message);
        }

        let snapshot = match self.records.lock() {
            Ok(mut records) => {
                records.push_back(record.clone());
                while records.len() > self.capacity {
                    records.pop_front();
                }
                records.iter().cloned().collect::<Vec<_>>()
            }
            Err(_) => return record,
        };

        if let Some(storage) = &self.storage {
            if let Err(error) = storage.write_json(keys::DIAGNOSTICS, &snapshot) {
                tracing::debug!(%error, "diagnostic log not persisted");
            }
        }

        record
    }

    pub fn read_recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.records
            .lock()
            .map(|records| records.iter().filter(|record| record.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
        if let Some(storage) = &self.storage {
            let _ = storage.remove(keys::DIAGNOSTICS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn evicts_oldest_records_beyond_capacity() {
        let diagnostics = Diagnostics::new(2, None);
        diagnostics.record(ErrorKind::Unknown, "one", None);
        diagnostics.record(ErrorKind::Unknown, "two", None);
        diagnostics.record(ErrorKind::Unknown, "three", None);

        let recent = diagnostics.read_recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "two");
        assert_eq!(recent[1].message, "three");
    }

    #[test]
    fn read_recent_returns_the_tail() {
        let diagnostics = Diagnostics::new(10, None);
        diagnostics.record(ErrorKind::Unknown, "start", None);
        diagnostics.record(ErrorKind::RemoteSyncFailed, "heartbeat", None);

        let recent = diagnostics.read_recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "heartbeat");
        assert_eq!(diagnostics.count_of(ErrorKind::RemoteSyncFailed), 1);
    }

    #[test]
    fn persisted_log_survives_reload() {
        let storage = SafeStorage::new(Arc::new(MemoryStore::new()));
        let diagnostics = Diagnostics::load(5, storage.clone());
        diagnostics.record(
            ErrorKind::LocalStorageFailed,
            "write failed",
            Some("quota".to_string()),
        );

        let reloaded = Diagnostics::load(5, storage);
        let recent = reloaded.read_recent(5);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].detail.as_deref(), Some("quota"));
    }

    #[test]
    fn clear_removes_persisted_entries() {
        let storage = SafeStorage::new(Arc::new(MemoryStore::new()));
        let diagnostics = Diagnostics::load(5, storage.clone());
        diagnostics.record(ErrorKind::Unknown, "boom", None);
        diagnostics.clear();

        assert!(diagnostics.read_recent(5).is_empty());
        assert_eq!(
            storage
                .read_string(keys::DIAGNOSTICS)
                .expect("read should work"),
            None
        );
    }
}
