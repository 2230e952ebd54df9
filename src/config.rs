use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::diagnostics::DEFAULT_CAPACITY;
use crate::media::AudioConstraintPolicy;

pub const ENGINE_API_KEY_ENV: &str = "STAMP_RALLY_ENGINE_API_KEY";
pub const BACKEND_KEY_ENV: &str = "STAMP_RALLY_BACKEND_KEY";

/// Credential that never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config path has no parent directory")]
    NoParent,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    pub module_url: String,
    pub fingerprint_db_url: String,
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default)]
    pub api_key_in_module_url: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            module_url: "https://cdn.example.com/recognizer/v1/recognizer.js".to_string(),
            fingerprint_db_url: "https://cdn.example.com/recognizer/v1/fingerprints.db".to_string(),
            api_key: None,
            api_key_in_module_url: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendSettings {
    pub base_url: String,
    pub anon_key: Secret,
    #[serde(default = "default_progress_table")]
    pub progress_table: String,
}

fn default_progress_table() -> String {
    "user_progress".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RallyConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub backend: Option<BackendSettings>,
    #[serde(default)]
    pub audio: AudioConstraintPolicy,
    #[serde(default = "default_award_guard_ms")]
    pub award_guard_ms: u64,
    #[serde(default = "default_completion_delay_ms")]
    pub completion_delay_ms: u64,
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    #[serde(default = "default_sync_heartbeat_ms")]
    pub sync_heartbeat_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_backup_max_age_ms")]
    pub backup_max_age_ms: u64,
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,
}

fn default_award_guard_ms() -> u64 {
    800
}

fn default_completion_delay_ms() -> u64 {
    1_500
}

fn default_sync_debounce_ms() -> u64 {
    1_000
}

fn default_sync_heartbeat_ms() -> u64 {
    30_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_backup_max_age_ms() -> u64 {
    24 * 60 * 60 * 1_000
}

fn default_diagnostics_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for RallyConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            backend: None,
            audio: AudioConstraintPolicy::default(),
            award_guard_ms: default_award_guard_ms(),
            completion_delay_ms: default_completion_delay_ms(),
            sync_debounce_ms: default_sync_debounce_ms(),
            sync_heartbeat_ms: default_sync_heartbeat_ms(),
            health_interval_ms: default_health_interval_ms(),
            backup_max_age_ms: default_backup_max_age_ms(),
            diagnostics_capacity: default_diagnostics_capacity(),
        }
    }
}

impl RallyConfig {
    pub fn award_guard(&self) -> Duration {
        Duration::from_millis(self.award_guard_ms)
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }

    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    pub fn sync_heartbeat(&self) -> Duration {
        Duration::from_millis(self.sync_heartbeat_ms.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn backup_max_age(&self) -> Duration {
        Duration::from_millis(self.backup_max_age_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RallyConfigPatch {
    pub engine_module_url: Option<String>,
    pub fingerprint_db_url: Option<String>,
    pub engine_api_key: Option<Option<String>>,
    pub audio: Option<AudioConstraintPolicy>,
    pub award_guard_ms: Option<u64>,
    pub completion_delay_ms: Option<u64>,
}

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("stamp-rally").join("config.json")
}

pub fn load_or_default(path: &Path) -> RallyConfig {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str::<RallyConfig>(&contents).unwrap_or_else(|error| {
            tracing::warn!(path = %path.display(), %error, "config unreadable, using defaults");
            RallyConfig::default()
        }),
        Err(_) => RallyConfig::default(),
    }
}

pub fn save(path: &Path, config: &RallyConfig) -> Result<(), ConfigError> {
    let parent = path.parent().ok_or(ConfigError::NoParent)?;
    fs::create_dir_all(parent)?;
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn apply_patch(config: &RallyConfig, patch: RallyConfigPatch) -> RallyConfig {
    let non_empty = |value: String| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    };

    RallyConfig {
        engine: EngineSettings {
            module_url: patch
                .engine_module_url
                .and_then(non_empty)
                .unwrap_or_else(|| config.engine.module_url.clone()),
            fingerprint_db_url: patch
                .fingerprint_db_url
                .and_then(non_empty)
                .unwrap_or_else(|| config.engine.fingerprint_db_url.clone()),
            api_key: patch
                .engine_api_key
                .map(|value| value.and_then(non_empty).map(Secret::new))
                .unwrap_or_else(|| config.engine.api_key.clone()),
            api_key_in_module_url: config.engine.api_key_in_module_url,
        },
        audio: patch.audio.unwrap_or(config.audio),
        award_guard_ms: patch.award_guard_ms.unwrap_or(config.award_guard_ms),
        completion_delay_ms: patch
            .completion_delay_ms
            .unwrap_or(config.completion_delay_ms),
        ..config.clone()
    }
}

pub fn apply_env_overrides<F>(config: &RallyConfig, lookup: F) -> RallyConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut updated = config.clone();
    if let Some(key) = lookup(ENGINE_API_KEY_ENV).filter(|value| !value.trim().is_empty()) {
        updated.engine.api_key = Some(Secret::new(key.trim()));
    }
    if let Some(key) = lookup(BACKEND_KEY_ENV).filter(|value| !value.trim().is_empty()) {
        if let Some(backend) = updated.backend.as_mut() {
            backend.anon_key = Secret::new(key.trim());
        }
    }
    updated
}
