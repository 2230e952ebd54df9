use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, Stamp};
use crate::config::RallyConfig;
use crate::diagnostics::Diagnostics;
use crate::engine::{DetectionEvent, EngineLoader};
use crate::error::{present, ErrorKind, UserNotice};
use crate::health::{self, HealthMonitor, HealthReport};
use crate::identity::{self, Identity};
use crate::ledger::{AwardOutcome, LedgerOptions, LedgerSnapshot, StampLedger};
use crate::media::{AudioBackend, MediaDevices, Platform};
use crate::remote::RemoteStore;
use crate::session::{SessionController, SessionError, SessionStatus};
use crate::storage::{SafeStorage, StorageError};
use crate::sync::{self, SyncOptions, SyncTask};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum RallyError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("rally state lock poisoned")]
    StatePoisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RallyEvent {
    StampAwarded {
        stamp: Stamp,
        collected: usize,
        total: usize,
    },
    ProgressWarning {
        notice: UserNotice,
    },
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RallyStatus {
    pub session: SessionStatus,
    pub collected: Vec<Stamp>,
    pub total: usize,
    pub is_complete: bool,
    pub identity: Identity,
}

pub struct RallyDeps {
    pub catalog: Arc<Catalog>,
    pub storage: SafeStorage,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub media: Arc<dyn MediaDevices>,
    pub audio: Arc<dyn AudioBackend>,
    pub engine: Arc<dyn EngineLoader>,
    pub platform: Platform,
}

#[derive(Default)]
struct Tasks {
    sync: Option<SyncTask>,
    health: Option<HealthMonitor>,
    pump: Option<JoinHandle<()>>,
    completion: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        self.sync = None;
        self.health = None;
        for handle in [self.pump.take(), self.completion.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

struct RallyInner {
    config: RallyConfig,
    storage: SafeStorage,
    remote: Option<Arc<dyn RemoteStore>>,
    diagnostics: Arc<Diagnostics>,
    ledger: Arc<Mutex<StampLedger>>,
    controller: SessionController,
    identity: Mutex<Identity>,
    events: broadcast::Sender<RallyEvent>,
    terminal: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl Drop for RallyInner {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            tasks.abort_all();
        }
    }
}

#[derive(Clone)]
pub struct Rally {
    inner: Arc<RallyInner>,
}

impl Rally {
    pub async fn bootstrap(config: RallyConfig, deps: RallyDeps) -> Self {
        let diagnostics = Arc::new(Diagnostics::load(
            config.diagnostics_capacity,
            deps.storage.clone(),
        ));
        let mut ledger = StampLedger::load(
            deps.catalog.clone(),
            deps.storage.clone(),
            diagnostics.clone(),
            LedgerOptions {
                award_guard: config.award_guard(),
                backup_max_age: config.backup_max_age(),
            },
        );

        let identity = identity::bootstrap(&deps.storage, deps.remote.as_deref(), &diagnostics).await;
        if let (Some(remote), Some(user_id)) = (&deps.remote, identity.remote_user_id()) {
            match remote.fetch_progress(user_id).await {
                Ok(Some(row)) => {
                    ledger.merge_remote(&row.stamps);
                }
                Ok(None) => {}
                Err(error) => {
                    diagnostics.record(
                        ErrorKind::RemoteSyncFailed,
                        "could not restore remote progress",
                        Some(error.to_string()),
                    );
                }
            }
        }

        let already_complete = ledger.is_complete();
        let snapshots = ledger.subscribe();
        let controller = SessionController::new(
            deps.media,
            deps.audio,
            deps.engine,
            config.engine.clone(),
            config.audio.constraints_for(deps.platform),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ledger = Arc::new(Mutex::new(ledger));

        let health = health::spawn_monitor(
            ledger.clone(),
            deps.storage.clone(),
            diagnostics.clone(),
            config.health_interval(),
        );
        let sync = Self::spawn_sync_for(&config, deps.remote.as_ref(), &identity, snapshots, &diagnostics);
        tracing::info!(
            identity = identity.id(),
            complete = already_complete,
            "stamp rally ready"
        );

        let rally = Self {
            inner: Arc::new(RallyInner {
                config,
                storage: deps.storage,
                remote: deps.remote,
                diagnostics,
                ledger,
                controller,
                identity: Mutex::new(identity),
                events,
                terminal: AtomicBool::new(already_complete),
                tasks: Mutex::new(Tasks::default()),
            }),
        };

        let pump = rally.spawn_detection_pump();
        if let Ok(mut tasks) = rally.inner.tasks.lock() {
            tasks.sync = sync;
            tasks.health = Some(health);
            tasks.pump = Some(pump);
        }
        rally
    }

    fn spawn_sync_for(
        config: &RallyConfig,
        remote: Option<&Arc<dyn RemoteStore>>,
        identity: &Identity,
        snapshots: tokio::sync::watch::Receiver<LedgerSnapshot>,
        diagnostics: &Arc<Diagnostics>,
    ) -> Option<SyncTask> {
        let remote = remote?;
        let user_id = identity.remote_user_id()?;
        Some(sync::spawn_sync(
            remote.clone(),
            user_id.to_string(),
            snapshots,
            diagnostics.clone(),
            SyncOptions {
                debounce: config.sync_debounce(),
                heartbeat: config.sync_heartbeat(),
            },
        ))
    }

    fn spawn_detection_pump(&self) -> JoinHandle<()> {
        let mut detections = self.inner.controller.subscribe();
        let weak: Weak<RallyInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match detections.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(error) = (Rally { inner }).handle_detection(&event).await {
                            tracing::error!(%error, "failed to apply detection");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "detection pump lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn ledger(&self) -> Result<MutexGuard<'_, StampLedger>, RallyError> {
        self.inner.ledger.lock().map_err(|_| RallyError::StatePoisoned)
    }

    fn emit(&self, event: RallyEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RallyEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> &SessionController {
        &self.inner.controller
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    pub fn identity(&self) -> Result<Identity, RallyError> {
        self.inner
            .identity
            .lock()
            .map(|identity| identity.clone())
            .map_err(|_| RallyError::StatePoisoned)
    }

    pub fn health_report(&self) -> Option<HealthReport> {
        self.inner
            .tasks
            .lock()
            .ok()?
            .health
            .as_ref()
            .and_then(HealthMonitor::last_report)
    }

    pub fn is_complete(&self) -> Result<bool, RallyError> {
        Ok(self.ledger()?.is_complete())
    }

    pub fn progress(&self) -> Result<(usize, usize), RallyError> {
        Ok(self.ledger()?.progress())
    }

    pub fn status(&self) -> Result<RallyStatus, RallyError> {
        let session = self.inner.controller.status()?;
        let identity = self.identity()?;
        let ledger = self.ledger()?;
        Ok(RallyStatus {
            session,
            collected: ledger.collected_stamps().into_iter().cloned().collect(),
            total: ledger.catalog().len(),
            is_complete: ledger.is_complete(),
            identity,
        })
    }

    pub async fn handle_detection(&self, event: &DetectionEvent) -> Result<AwardOutcome, RallyError> {
        let outcome = self.ledger()?.apply_detection(event);
        let AwardOutcome::Awarded(award) = &outcome else {
            return Ok(outcome);
        };

        self.emit(RallyEvent::StampAwarded {
            stamp: award.stamp.clone(),
            collected: award.collected,
            total: award.total,
        });
        if !award.persisted {
            if let Some(notice) = present(
                ErrorKind::LocalStorageFailed,
                "Your stamp was collected but could not be saved on this device.",
            ) {
                self.emit(RallyEvent::ProgressWarning { notice });
            }
        }
        if award.completed {
            self.complete().await;
        }
        Ok(outcome)
    }

    async fn complete(&self) {
        if self.inner.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("all stamps collected");
        if let Err(error) = self.inner.controller.stop().await {
            tracing::warn!(%error, "failed to stop session after completion");
        }

        let delay = self.inner.config.completion_delay();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = inner.events.send(RallyEvent::Completed);
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.completion = Some(handle);
        }
    }

    pub async fn toggle_recording(&self) -> Result<SessionStatus, RallyError> {
        if self.is_complete()? {
            return Ok(self.inner.controller.status()?);
        }
        Ok(self.inner.controller.toggle().await?)
    }

    pub async fn reset(&self) -> Result<(), RallyError> {
        self.inner.controller.stop().await?;
        let previous = self.identity()?;
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.sync = None;
            if let Some(completion) = tasks.completion.take() {
                completion.abort();
            }
        }

        let snapshot = {
            let mut ledger = self.ledger()?;
            if let Err(error) = ledger.reset() {
                self.inner.diagnostics.record(
                    ErrorKind::LocalStorageFailed,
                    "stored progress could not be cleared",
                    Some(error.to_string()),
                );
            }
            ledger.snapshot()
        };
        self.inner.terminal.store(false, Ordering::SeqCst);

        if let (Some(remote), Some(user_id)) = (&self.inner.remote, previous.remote_user_id()) {
            sync::push_now(remote.as_ref(), user_id, &snapshot, &self.inner.diagnostics).await;
            if let Err(error) = remote.sign_out().await {
                self.inner.diagnostics.record(
                    ErrorKind::RemoteSyncFailed,
                    "sign-out failed",
                    Some(error.to_string()),
                );
            }
        }

        identity::forget(&self.inner.storage)?;
        let fresh = Identity::local();
        tracing::info!(identity = fresh.id(), "rally reset");
        *self
            .inner
            .identity
            .lock()
            .map_err(|_| RallyError::StatePoisoned)? = fresh;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), RallyError> {
        self.inner.controller.stop().await?;
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.abort_all();
        }
        let identity = self.identity()?;
        if let (Some(remote), Some(user_id)) = (&self.inner.remote, identity.remote_user_id()) {
            let snapshot = self.ledger()?.snapshot();
            sync::push_now(remote.as_ref(), user_id, &snapshot, &self.inner.diagnostics).await;
        }
        tracing::info!("stamp rally shut down");
        Ok(())
    }
}
