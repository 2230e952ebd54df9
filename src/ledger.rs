use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::backup::{self, current_unix_ms};
use crate::catalog::{Catalog, Stamp};
use crate::diagnostics::Diagnostics;
use crate::engine::DetectionEvent;
use crate::error::ErrorKind;
use crate::storage::{keys, SafeStorage, StorageError, StorageResult};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub stamps: Vec<u32>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StampAward {
    pub stamp: Stamp,
    pub collected: usize,
    pub total: usize,
    pub completed: bool,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwardOutcome {
    UnknownTag,
    AlreadyCollected { stamp_id: u32 },
    Suppressed { stamp_id: u32 },
    Awarded(StampAward),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Empty,
    Primary,
    Backup,
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    pub award_guard: Duration,
    pub backup_max_age: Duration,
}

pub struct StampLedger {
    catalog: Arc<Catalog>,
    storage: SafeStorage,
    diagnostics: Arc<Diagnostics>,
    options: LedgerOptions,
    collected: Vec<u32>,
    is_complete: bool,
    guard_until: Option<Instant>,
    load_source: LoadSource,
    snapshots: watch::Sender<LedgerSnapshot>,
}

impl StampLedger {
    pub fn load(
        catalog: Arc<Catalog>,
        storage: SafeStorage,
        diagnostics: Arc<Diagnostics>,
        options: LedgerOptions,
    ) -> Self {
        let (stamps, load_source) = match storage.read_json::<Vec<u32>>(keys::COLLECTED) {
            Ok(Some(stamps)) => (stamps, LoadSource::Primary),
            Ok(None) => (Vec::new(), LoadSource::Empty),
            Err(error) => {
                diagnostics.record(
                    ErrorKind::LocalStorageFailed,
                    "stored stamp ledger is unreadable",
                    Some(error.to_string()),
                );
                match backup::load_fresh(&storage, current_unix_ms(), options.backup_max_age) {
                    Some(backup) => {
                        tracing::info!(stamps = backup.stamps.len(), "restored stamp ledger from backup");
                        (backup.stamps, LoadSource::Backup)
                    }
                    None => {
                        tracing::warn!("no fresh ledger backup; starting empty");
                        (Vec::new(), LoadSource::Empty)
                    }
                }
            }
        };

        let (snapshots, _) = watch::channel(LedgerSnapshot {
            stamps: Vec::new(),
            is_complete: false,
        });
        let mut ledger = Self {
            catalog,
            storage,
            diagnostics,
            options,
            collected: Vec::new(),
            is_complete: false,
            guard_until: None,
            load_source,
            snapshots,
        };

        let (clean, removed) = sanitize(&ledger.catalog, &stamps);
        ledger.replace(clean);
        if load_source == LoadSource::Backup || removed > 0 {
            ledger.persist_or_record("repaired ledger not saved");
        }
        ledger
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    pub fn collected_ids(&self) -> &[u32] {
        &self.collected
    }

    pub fn collected_stamps(&self) -> Vec<&Stamp> {
        self.collected
            .iter()
            .filter_map(|id| self.catalog.by_id(*id))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.collected.len(), self.catalog.len())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            stamps: self.collected.clone(),
            is_complete: self.is_complete,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LedgerSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn apply_detection(&mut self, event: &DetectionEvent) -> AwardOutcome {
        self.apply_detection_at(event, Instant::now())
    }

    pub fn apply_detection_at(&mut self, event: &DetectionEvent, now: Instant) -> AwardOutcome {
        let Some(stamp) = self.catalog.by_tag(&event.detection_tag).cloned() else {
            tracing::trace!(tag = %event.detection_tag, "ignoring unknown detection tag");
            return AwardOutcome::UnknownTag;
        };
        if self.collected.contains(&stamp.id) {
            return AwardOutcome::AlreadyCollected { stamp_id: stamp.id };
        }
        if self.guard_until.is_some_and(|until| now < until) {
            tracing::debug!(stamp_id = stamp.id, "award suppressed while previous award is shown");
            return AwardOutcome::Suppressed { stamp_id: stamp.id };
        }

        self.collected.push(stamp.id);
        self.is_complete = self.covers_catalog();
        self.guard_until = Some(now + self.options.award_guard);
        let persisted = self.persist_or_record("stamp award not saved on this device");
        self.publish();

        let (collected, total) = self.progress();
        tracing::info!(stamp_id = stamp.id, collected, total, "stamp awarded");
        AwardOutcome::Awarded(StampAward {
            stamp,
            collected,
            total,
            completed: self.is_complete,
            persisted,
        })
    }

    pub fn merge_remote(&mut self, stamps: &[u32]) -> usize {
        let mut added = 0;
        for id in stamps {
            if self.collected.len() >= self.catalog.len() {
                break;
            }
            if self.catalog.contains_id(*id) && !self.collected.contains(id) {
                self.collected.push(*id);
                added += 1;
            }
        }
        if added > 0 {
            self.is_complete = self.covers_catalog();
            self.persist_or_record("merged ledger not saved");
            self.publish();
            tracing::info!(added, "merged remote progress");
        }
        added
    }

    pub fn repair(&mut self) -> StorageResult<usize> {
        let (clean, removed) = sanitize(&self.catalog, &self.collected);
        let mut repairs = removed;
        if removed > 0 {
            tracing::warn!(removed, "dropping invalid stamp ids from ledger");
            self.replace(clean);
        }

        let stored_matches = matches!(
            self.storage.read_json::<Vec<u32>>(keys::COLLECTED),
            Ok(Some(ref stored)) if *stored == self.collected
        ) || (self.collected.is_empty()
            && matches!(self.storage.read_string(keys::COLLECTED), Ok(None)));
        if removed > 0 || !stored_matches {
            if !stored_matches {
                tracing::warn!("stored ledger disagrees with memory; rewriting");
                repairs += 1;
            }
            self.persist()?;
        }
        Ok(repairs)
    }

    pub fn reset(&mut self) -> StorageResult<()> {
        self.collected.clear();
        self.is_complete = false;
        self.guard_until = None;
        self.publish();
        tracing::info!("stamp ledger reset");

        let results = [
            self.storage.remove(keys::COLLECTED),
            self.storage.remove(keys::COMPLETED),
            backup::clear(&self.storage),
        ];
        results.into_iter().collect::<Result<Vec<_>, StorageError>>().map(|_| ())
    }

    fn covers_catalog(&self) -> bool {
        self.collected.len() == self.catalog.len()
    }

    fn replace(&mut self, stamps: Vec<u32>) {
        self.collected = stamps;
        self.is_complete = self.covers_catalog();
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn persist(&self) -> StorageResult<()> {
        self.storage.write_json(keys::COLLECTED, &self.collected)?;
        self.storage.write_flag(keys::COMPLETED, self.is_complete)?;
        if let Err(error) = backup::save(
            &self.storage,
            &self.collected,
            self.is_complete,
            current_unix_ms(),
        ) {
            self.diagnostics.record(
                ErrorKind::LocalStorageFailed,
                "ledger backup not written",
                Some(error.to_string()),
            );
        }
        Ok(())
    }

    fn persist_or_record(&self, message: &str) -> bool {
        match self.persist() {
            Ok(()) => true,
            Err(error) => {
                self.diagnostics.record(
                    ErrorKind::LocalStorageFailed,
                    message,
                    Some(error.to_string()),
                );
                false
            }
        }
    }
}

fn sanitize(catalog: &Catalog, stamps: &[u32]) -> (Vec<u32>, usize) {
    let mut seen = HashSet::new();
    let clean = stamps
        .iter()
        .copied()
        .filter(|id| catalog.contains_id(*id) && seen.insert(*id))
        .take(catalog.len())
        .collect::<Vec<_>>();
    let removed = stamps.len() - clean.len();
    (clean, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::StateBackup;
    use crate::catalog::sample_catalog;
    use crate::storage::MemoryStore;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Rig {
        store: Arc<MemoryStore>,
        storage: SafeStorage,
        diagnostics: Arc<Diagnostics>,
    }

    impl Rig {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self {
                storage: SafeStorage::new(store.clone()),
                store,
                diagnostics: Arc::new(Diagnostics::new(20, None)),
            }
        }

        fn ledger(&self, award_guard: Duration) -> StampLedger {
            StampLedger::load(
                Arc::new(sample_catalog()),
                self.storage.clone(),
                self.diagnostics.clone(),
                LedgerOptions {
                    award_guard,
                    backup_max_age: DAY,
                },
            )
        }
    }

    fn detection(tag: &str) -> DetectionEvent {
        DetectionEvent {
            detection_tag: tag.to_string(),
            position: 0.0,
        }
    }

    #[test]
    fn unknown_tags_leave_ledger_untouched() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        let writes_before = rig.store.write_count();

        for tag in ["x", "", "A", "noise"] {
            assert_eq!(ledger.apply_detection(&detection(tag)), AwardOutcome::UnknownTag);
        }

        assert!(ledger.collected_ids().is_empty());
        assert_eq!(rig.store.write_count(), writes_before);
    }

    #[test]
    fn repeated_detections_award_once() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);

        let outcomes = (0..5)
            .map(|_| ledger.apply_detection(&detection("b")))
            .collect::<Vec<_>>();

        let awards = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, AwardOutcome::Awarded(_)))
            .count();
        assert_eq!(awards, 1);
        assert_eq!(ledger.collected_ids(), &[2]);
        assert_eq!(outcomes[4], AwardOutcome::AlreadyCollected { stamp_id: 2 });
    }

    #[test]
    fn rally_scenario_completes_on_last_stamp() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);

        let mut awards = Vec::new();
        for tag in ["a", "a", "b", "x", "c", "d"] {
            if let AwardOutcome::Awarded(award) = ledger.apply_detection(&detection(tag)) {
                awards.push(award);
            }
        }

        assert_eq!(awards.len(), 4);
        assert!(awards[..3].iter().all(|award| !award.completed));
        assert!(awards[3].completed);
        assert_eq!(awards[3].stamp.detection_tag, "d");
        assert_eq!(ledger.collected_ids(), &[1, 2, 3, 4]);
        assert!(ledger.is_complete());
    }

    #[test]
    fn guard_window_suppresses_back_to_back_awards() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::from_millis(800));
        let start = Instant::now();

        assert!(matches!(
            ledger.apply_detection_at(&detection("a"), start),
            AwardOutcome::Awarded(_)
        ));
        assert_eq!(
            ledger.apply_detection_at(&detection("b"), start + Duration::from_millis(300)),
            AwardOutcome::Suppressed { stamp_id: 2 }
        );
        assert_eq!(
            ledger.apply_detection_at(&detection("a"), start + Duration::from_millis(300)),
            AwardOutcome::AlreadyCollected { stamp_id: 1 }
        );
        assert!(matches!(
            ledger.apply_detection_at(&detection("b"), start + Duration::from_millis(900)),
            AwardOutcome::Awarded(_)
        ));
    }

    #[test]
    fn completion_survives_reload() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        for tag in ["d", "b"] {
            ledger.apply_detection(&detection(tag));
        }

        let reloaded = rig.ledger(Duration::ZERO);
        assert_eq!(reloaded.collected_ids(), &[4, 2]);
        assert!(!reloaded.is_complete());
        assert_eq!(reloaded.load_source(), LoadSource::Primary);

        drop(reloaded);
        for tag in ["a", "c"] {
            ledger.apply_detection(&detection(tag));
        }
        let reloaded = rig.ledger(Duration::ZERO);
        assert_eq!(reloaded.snapshot(), ledger.snapshot());
        assert!(reloaded.is_complete());
        assert!(rig.storage.read_flag(keys::COMPLETED).expect("flag should read"));
    }

    #[test]
    fn storage_failure_keeps_award_in_memory() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        rig.store.set_fail_writes(true);

        let AwardOutcome::Awarded(award) = ledger.apply_detection(&detection("c")) else {
            panic!("award expected");
        };
        assert!(!award.persisted);
        assert_eq!(ledger.collected_ids(), &[3]);
        assert_eq!(rig.diagnostics.count_of(ErrorKind::LocalStorageFailed), 1);
    }

    #[test]
    fn corrupt_primary_restores_fresh_backup() {
        let rig = Rig::new();
        let backup = StateBackup {
            stamps: vec![1, 3],
            is_complete: false,
            timestamp_unix_ms: current_unix_ms(),
        };
        rig.storage
            .write_json(keys::BACKUP, &backup)
            .expect("backup fixture should write");
        rig.store.insert_raw(keys::COLLECTED, "{corrupt");

        let ledger = rig.ledger(Duration::ZERO);
        assert_eq!(ledger.load_source(), LoadSource::Backup);
        assert_eq!(ledger.collected_ids(), &[1, 3]);
        assert_eq!(
            rig.storage
                .read_json::<Vec<u32>>(keys::COLLECTED)
                .expect("primary should be rewritten"),
            Some(vec![1, 3])
        );
    }

    #[test]
    fn corrupt_primary_with_stale_backup_starts_empty() {
        let rig = Rig::new();
        let backup = StateBackup {
            stamps: vec![1, 3],
            is_complete: false,
            timestamp_unix_ms: current_unix_ms() - DAY.as_millis() - 60_000,
        };
        rig.storage
            .write_json(keys::BACKUP, &backup)
            .expect("backup fixture should write");
        rig.store.insert_raw(keys::COLLECTED, "{corrupt");

        let ledger = rig.ledger(Duration::ZERO);
        assert_eq!(ledger.load_source(), LoadSource::Empty);
        assert!(ledger.collected_ids().is_empty());
        assert_eq!(rig.diagnostics.count_of(ErrorKind::LocalStorageFailed), 1);
    }

    #[test]
    fn oversized_stored_set_is_truncated_on_load() {
        let rig = Rig::new();
        rig.store
            .insert_raw(keys::COLLECTED, "[4, 4, 9, 1, 2, 3, 0, 5, 6]");

        let ledger = rig.ledger(Duration::ZERO);
        assert_eq!(ledger.collected_ids(), &[4, 1, 2, 3]);
        assert!(ledger.is_complete());
    }

    #[test]
    fn repair_rewrites_externally_corrupted_storage() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        ledger.apply_detection(&detection("a"));
        rig.store.insert_raw(keys::COLLECTED, "[1, 2, 3, 4, 5, 6, 7]");

        let repairs = ledger.repair().expect("repair should succeed");
        assert_eq!(repairs, 1);
        assert_eq!(
            rig.storage
                .read_json::<Vec<u32>>(keys::COLLECTED)
                .expect("read should work"),
            Some(vec![1])
        );
        assert_eq!(ledger.repair().expect("second repair should succeed"), 0);
    }

    #[test]
    fn merge_remote_only_adds_catalog_stamps() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        ledger.apply_detection(&detection("a"));

        let added = ledger.merge_remote(&[1, 3, 42]);
        assert_eq!(added, 1);
        assert_eq!(ledger.collected_ids(), &[1, 3]);
    }

    #[test]
    fn reset_clears_memory_and_storage() {
        let rig = Rig::new();
        let mut ledger = rig.ledger(Duration::ZERO);
        let mut snapshots = ledger.subscribe();
        ledger.apply_detection(&detection("a"));
        ledger.apply_detection(&detection("b"));

        ledger.reset().expect("reset should succeed");

        assert!(ledger.collected_ids().is_empty());
        assert!(!ledger.is_complete());
        assert_eq!(
            *snapshots.borrow_and_update(),
            LedgerSnapshot {
                stamps: Vec::new(),
                is_complete: false
            }
        );
        assert_eq!(rig.storage.read_string(keys::COLLECTED).expect("read"), None);
        assert_eq!(rig.storage.read_string(keys::BACKUP).expect("read"), None);

        let reloaded = rig.ledger(Duration::ZERO);
        assert!(reloaded.collected_ids().is_empty());
    }
}
