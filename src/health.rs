use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::backup::current_unix_ms;
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::ledger::StampLedger;
use crate::storage::{keys, SafeStorage, StorageError, StorageResult};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub storage_ok: bool,
    pub repaired: usize,
    pub checked_at_unix_ms: u128,
}

pub fn storage_smoke_test(storage: &SafeStorage) -> StorageResult<()> {
    let probe = current_unix_ms().to_string();
    storage.write_string(keys::HEALTH_PROBE, &probe)?;
    let read_back = storage.read_string(keys::HEALTH_PROBE)?;
    storage.remove(keys::HEALTH_PROBE)?;
    if read_back.as_deref() != Some(probe.as_str()) {
        return Err(StorageError::Corrupt {
            key: keys::HEALTH_PROBE.to_string(),
            reason: "sentinel did not round-trip".to_string(),
        });
    }
    Ok(())
}

pub fn check(
    ledger: &mut StampLedger,
    storage: &SafeStorage,
    diagnostics: &Diagnostics,
) -> HealthReport {
    let storage_ok = match storage_smoke_test(storage) {
        Ok(()) => true,
        Err(error) => {
            diagnostics.record(
                ErrorKind::LocalStorageFailed,
                "local storage failed its health check",
                Some(error.to_string()),
            );
            false
        }
    };

    let repaired = match ledger.repair() {
        Ok(repaired) => repaired,
        Err(error) => {
            diagnostics.record(
                ErrorKind::LocalStorageFailed,
                "ledger repair could not be saved",
                Some(error.to_string()),
            );
            0
        }
    };
    if repaired > 0 {
        tracing::info!(repaired, "health check repaired ledger");
    }

    HealthReport {
        storage_ok,
        repaired,
        checked_at_unix_ms: current_unix_ms(),
    }
}

pub struct HealthMonitor {
    handle: JoinHandle<()>,
    reports: watch::Receiver<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn last_report(&self) -> Option<HealthReport> {
        self.reports.borrow().clone()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn spawn_monitor(
    ledger: Arc<Mutex<StampLedger>>,
    storage: SafeStorage,
    diagnostics: Arc<Diagnostics>,
    interval: Duration,
) -> HealthMonitor {
    let (reports_tx, reports) = watch::channel(None);
    let handle = tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let report = match ledger.lock() {
                Ok(mut ledger) => check(&mut ledger, &storage, &diagnostics),
                Err(_) => {
                    diagnostics.record(ErrorKind::Unknown, "ledger lock poisoned", None);
                    break;
                }
            };
            reports_tx.send_replace(Some(report));
        }
    });
    HealthMonitor { handle, reports }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sample_catalog;
    use crate::engine::DetectionEvent;
    use crate::ledger::LedgerOptions;
    use crate::storage::MemoryStore;

    fn ledger(storage: &SafeStorage, diagnostics: &Arc<Diagnostics>) -> StampLedger {
        StampLedger::load(
            Arc::new(sample_catalog()),
            storage.clone(),
            diagnostics.clone(),
            LedgerOptions {
                award_guard: Duration::ZERO,
                backup_max_age: Duration::from_secs(86_400),
            },
        )
    }

    #[test]
    fn smoke_test_leaves_no_sentinel_behind() {
        let storage = SafeStorage::new(Arc::new(MemoryStore::new()));
        storage_smoke_test(&storage).expect("healthy storage should pass");
        assert_eq!(
            storage.read_string(keys::HEALTH_PROBE).expect("read should work"),
            None
        );
    }

    #[test]
    fn failing_storage_is_reported_without_touching_ledger() {
        let store = Arc::new(MemoryStore::new());
        let storage = SafeStorage::new(store.clone());
        let diagnostics = Arc::new(Diagnostics::new(10, None));
        let mut ledger = ledger(&storage, &diagnostics);
        ledger.apply_detection(&DetectionEvent {
            detection_tag: "a".to_string(),
            position: 0.0,
        });
        store.set_fail_writes(true);

        let report = check(&mut ledger, &storage, &diagnostics);
        assert!(!report.storage_ok);
        assert_eq!(ledger.collected_ids(), &[1]);
        assert_eq!(diagnostics.count_of(ErrorKind::LocalStorageFailed), 1);
    }

    #[test]
    fn check_repairs_externally_damaged_ledger() {
        let store = Arc::new(MemoryStore::new());
        let storage = SafeStorage::new(store.clone());
        let diagnostics = Arc::new(Diagnostics::new(10, None));
        let mut ledger = ledger(&storage, &diagnostics);
        store.insert_raw(keys::COLLECTED, "[9, 9, 9]");

        let report = check(&mut ledger, &storage, &diagnostics);
        assert!(report.storage_ok);
        assert_eq!(report.repaired, 1);
        assert_eq!(
            storage
                .read_json::<Vec<u32>>(keys::COLLECTED)
                .expect("read should work"),
            Some(Vec::new())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_a_report_each_interval() {
        let storage = SafeStorage::new(Arc::new(MemoryStore::new()));
        let diagnostics = Arc::new(Diagnostics::new(10, None));
        let ledger = Arc::new(Mutex::new(ledger(&storage, &diagnostics)));

        let monitor = spawn_monitor(ledger, storage, diagnostics, Duration::from_secs(30));
        assert_eq!(monitor.last_report(), None);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let report = monitor.last_report().expect("first report should exist");
        assert!(report.storage_ok);
        assert_eq!(report.repaired, 0);
    }
}
