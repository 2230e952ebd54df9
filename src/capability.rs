use serde::Serialize;
use thiserror::Error;

use crate::health::storage_smoke_test;
use crate::media::Platform;
use crate::storage::SafeStorage;

const LOW_BATTERY: f32 = 0.20;
const CRITICAL_BATTERY: f32 = 0.10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ProbeError(pub String);

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct BatteryStatus {
    pub level: f32,
    pub charging: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub online: bool,
    pub effective_type: Option<String>,
    pub save_data: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CapabilityReport {
    pub platform: Platform,
    pub microphone: bool,
    pub audio_processing: bool,
    pub local_storage: bool,
    pub share: bool,
    pub permissions_api: bool,
    pub battery: Option<BatteryStatus>,
    pub network: Option<NetworkInfo>,
    pub warnings: Vec<String>,
}

pub trait CapabilitySource {
    fn platform(&self) -> Platform;
    fn microphone(&self) -> Result<bool, ProbeError>;
    fn audio_processing(&self) -> Result<bool, ProbeError>;
    fn local_storage(&self) -> Result<bool, ProbeError>;
    fn share(&self) -> Result<bool, ProbeError>;
    fn permissions_api(&self) -> Result<bool, ProbeError>;
    fn battery(&self) -> Result<Option<BatteryStatus>, ProbeError>;
    fn network(&self) -> Result<Option<NetworkInfo>, ProbeError>;
}

fn guarded<T>(name: &str, result: Result<T, ProbeError>, fallback: T) -> T {
    result.unwrap_or_else(|error| {
        tracing::debug!(probe = name, %error, "capability probe failed");
        fallback
    })
}

pub fn probe(source: &dyn CapabilitySource) -> CapabilityReport {
    let mut report = CapabilityReport {
        platform: source.platform(),
        microphone: guarded("microphone", source.microphone(), false),
        audio_processing: guarded("audio_processing", source.audio_processing(), false),
        local_storage: guarded("local_storage", source.local_storage(), false),
        share: guarded("share", source.share(), false),
        permissions_api: guarded("permissions_api", source.permissions_api(), false),
        battery: guarded("battery", source.battery(), None),
        network: guarded("network", source.network(), None),
        warnings: Vec::new(),
    };
    report.warnings = warnings_for(&report);
    report
}

pub fn warnings_for(report: &CapabilityReport) -> Vec<String> {
    let mut warnings = Vec::new();

    if !report.microphone {
        warnings.push("No microphone access; stamps cannot be collected on this device.".to_string());
    }
    if !report.local_storage {
        warnings.push("Local storage is unavailable; progress will not survive a reload.".to_string());
    }

    if let Some(network) = &report.network {
        if !network.online {
            warnings.push("You are offline; progress will sync once you reconnect.".to_string());
        } else if matches!(network.effective_type.as_deref(), Some("slow-2g" | "2g")) {
            warnings.push("Slow network; loading the recognizer may take a while.".to_string());
        }
        if network.save_data {
            warnings.push("Data saver is on; the recognizer download may be blocked.".to_string());
        }
    }

    if let Some(battery) = report.battery.filter(|battery| !battery.charging) {
        if battery.level < CRITICAL_BATTERY {
            warnings.push("Battery critically low; listening may stop at any time.".to_string());
        } else if battery.level < LOW_BATTERY {
            warnings.push("Battery low; listening drains power quickly.".to_string());
        }
    }

    warnings
}

pub struct NativeCapabilities {
    storage: Option<SafeStorage>,
}

impl NativeCapabilities {
    pub fn new(storage: Option<SafeStorage>) -> Self {
        Self { storage }
    }
}

impl CapabilitySource for NativeCapabilities {
    fn platform(&self) -> Platform {
        Platform::native()
    }

    fn microphone(&self) -> Result<bool, ProbeError> {
        #[cfg(feature = "desktop")]
        {
            crate::audio::input_device_available().map_err(ProbeError)
        }
        #[cfg(not(feature = "desktop"))]
        {
            Err(ProbeError("native capture is not built in".to_string()))
        }
    }

    fn audio_processing(&self) -> Result<bool, ProbeError> {
        Ok(cfg!(feature = "desktop"))
    }

    fn local_storage(&self) -> Result<bool, ProbeError> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| ProbeError("no store configured".to_string()))?;
        storage_smoke_test(storage)
            .map(|_| true)
            .map_err(|error| ProbeError(error.to_string()))
    }

    fn share(&self) -> Result<bool, ProbeError> {
        Ok(false)
    }

    fn permissions_api(&self) -> Result<bool, ProbeError> {
        Ok(false)
    }

    fn battery(&self) -> Result<Option<BatteryStatus>, ProbeError> {
        Ok(None)
    }

    fn network(&self) -> Result<Option<NetworkInfo>, ProbeError> {
        Ok(None)
    }
}
