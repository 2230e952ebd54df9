use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Desktop,
}

impl Platform {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let lowered = user_agent.to_ascii_lowercase();
        if lowered.contains("iphone") || lowered.contains("ipad") || lowered.contains("ipod") {
            return Platform::Ios;
        }
        // iPadOS reports a desktop Safari agent but keeps the mobile audio stack.
        if lowered.contains("macintosh") && lowered.contains("mobile/") {
            return Platform::Ios;
        }
        if lowered.contains("android") {
            return Platform::Android;
        }
        Platform::Desktop
    }

    pub fn native() -> Self {
        match std::env::consts::OS {
            "ios" => Platform::Ios,
            "android" => Platform::Android,
            _ => Platform::Desktop,
        }
    }

    pub fn is_mobile(self) -> bool {
        matches!(self, Platform::Ios | Platform::Android)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
}

/// Capture processing per platform class. Mobile keeps every stage enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConstraintPolicy {
    #[serde(default = "default_mobile_constraints")]
    pub mobile: AudioConstraints,
    #[serde(default = "default_desktop_constraints")]
    pub desktop: AudioConstraints,
}

fn default_mobile_constraints() -> AudioConstraints {
    AudioConstraints {
        echo_cancellation: true,
        auto_gain_control: true,
        noise_suppression: true,
    }
}

fn default_desktop_constraints() -> AudioConstraints {
    AudioConstraints {
        echo_cancellation: false,
        auto_gain_control: true,
        noise_suppression: true,
    }
}

impl Default for AudioConstraintPolicy {
    fn default() -> Self {
        Self {
            mobile: default_mobile_constraints(),
            desktop: default_desktop_constraints(),
        }
    }
}

impl AudioConstraintPolicy {
    pub fn constraints_for(&self, platform: Platform) -> AudioConstraints {
        if platform.is_mobile() {
            self.mobile
        } else {
            self.desktop
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media capture unsupported: {0}")]
    Unsupported(String),
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to acquire microphone stream: {0}")]
    Acquisition(String),
    #[error("audio graph failure: {0}")]
    Graph(String),
}

pub type TrackEndedCallback = Box<dyn Fn() + Send + Sync>;

pub trait MediaStream: Send + Sync {
    fn stop_all_tracks(&self);
    fn live_track_count(&self) -> usize;
    /// Invoked when a track ends without `stop_all_tracks` being called.
    fn on_track_ended(&self, callback: TrackEndedCallback);
    /// Raw mono frames, for graphs that pump samples themselves. Taken at most once.
    fn take_frames(&self) -> Option<Receiver<Vec<f32>>> {
        None
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    fn is_supported(&self) -> bool;
    async fn get_user_media(
        &self,
        constraints: AudioConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

pub trait AudioNode: Send + Sync {
    fn process(&self, samples: &[f32]);
}

#[async_trait]
pub trait AudioGraph: Send + Sync {
    fn sample_rate_hz(&self) -> u32;
    fn connect(
        &self,
        stream: &Arc<dyn MediaStream>,
        node: Arc<dyn AudioNode>,
    ) -> Result<(), MediaError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait AudioBackend: Send + Sync {
    fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, MediaError>;
}
