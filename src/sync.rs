use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::ledger::LedgerSnapshot;
use crate::remote::{ProgressRow, RemoteStore};

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub debounce: Duration,
    pub heartbeat: Duration,
}

pub struct SyncTask {
    handle: JoinHandle<()>,
}

impl SyncTask {
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn row_for(user_id: &str, snapshot: &LedgerSnapshot) -> ProgressRow {
    ProgressRow {
        user_id: user_id.to_string(),
        stamps: snapshot.stamps.clone(),
        is_completed: snapshot.is_complete,
    }
}

pub async fn push_now(
    remote: &dyn RemoteStore,
    user_id: &str,
    snapshot: &LedgerSnapshot,
    diagnostics: &Diagnostics,
) -> bool {
    match remote.upsert_progress(&row_for(user_id, snapshot)).await {
        Ok(()) => {
            tracing::debug!(user_id, stamps = snapshot.stamps.len(), "progress synced");
            true
        }
        Err(error) => {
            diagnostics.record(
                ErrorKind::RemoteSyncFailed,
                "progress sync failed",
                Some(error.to_string()),
            );
            false
        }
    }
}

pub fn spawn_sync(
    remote: Arc<dyn RemoteStore>,
    user_id: String,
    mut snapshots: watch::Receiver<LedgerSnapshot>,
    diagnostics: Arc<Diagnostics>,
    options: SyncOptions,
) -> SyncTask {
    let handle = tokio::spawn(async move {
        let mut heartbeat = interval_at(Instant::now() + options.heartbeat, options.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        tracing::debug!("ledger dropped; stopping progress sync");
                        break;
                    }
                    tokio::time::sleep(options.debounce).await;
                    let snapshot = snapshots.borrow_and_update().clone();
                    push_now(remote.as_ref(), &user_id, &snapshot, &diagnostics).await;
                }
                _ = heartbeat.tick() => {
                    let snapshot = snapshots.borrow().clone();
                    push_now(remote.as_ref(), &user_id, &snapshot, &diagnostics).await;
                }
            }
        }
    });
    SyncTask { handle }
}
