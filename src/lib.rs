pub mod audio;
pub mod backup;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod health;
pub mod identity;
pub mod ledger;
pub mod media;
pub mod rally;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use capability::{CapabilityReport, NativeCapabilities};
use catalog::Catalog;
use engine::EngineLoader;
use media::{AudioBackend, MediaDevices, Platform};
use rally::{Rally, RallyDeps};
use remote::{RemoteStore, RestRemoteStore};
use storage::{FileStore, SafeStorage};

const DEFAULT_LOG_FILTER: &str = "stamp_rally_lib=info";

pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct Host {
    pub media: Arc<dyn MediaDevices>,
    pub audio: Arc<dyn AudioBackend>,
    pub engine: Arc<dyn EngineLoader>,
    pub platform: Platform,
}

#[cfg(feature = "desktop")]
impl Host {
    pub fn native(engine: Arc<dyn EngineLoader>) -> Self {
        Self {
            media: Arc::new(audio::CpalMediaDevices::new()),
            audio: Arc::new(audio::CpalAudioBackend::new()),
            engine,
            platform: Platform::native(),
        }
    }
}

pub fn probe_capabilities(storage: &SafeStorage) -> CapabilityReport {
    let report = capability::probe(&NativeCapabilities::new(Some(storage.clone())));
    for warning in &report.warnings {
        tracing::warn!(%warning, "capability warning");
    }
    report
}

fn remote_store(config: &config::RallyConfig) -> Option<Arc<dyn RemoteStore>> {
    let settings = config.backend.clone()?;
    match RestRemoteStore::new(settings) {
        Ok(store) => Some(Arc::new(store) as Arc<dyn RemoteStore>),
        Err(error) => {
            tracing::warn!(%error, "backend client unavailable; playing offline");
            None
        }
    }
}

pub async fn launch(catalog: Catalog, host: Host) -> Rally {
    let config_path = config::default_config_path();
    let config = config::apply_env_overrides(&config::load_or_default(&config_path), |name| {
        std::env::var(name).ok()
    });
    let storage = SafeStorage::new(Arc::new(FileStore::new(storage::default_store_path())));
    tracing::info!(
        config = %config_path.display(),
        stamps = catalog.len(),
        "launching stamp rally"
    );

    probe_capabilities(&storage);
    let remote = remote_store(&config);
    Rally::bootstrap(
        config,
        RallyDeps {
            catalog: Arc::new(catalog),
            storage,
            remote,
            media: host.media,
            audio: host.audio,
            engine: host.engine,
            platform: host.platform,
        },
    )
    .await
}
