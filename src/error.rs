use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedEnvironment,
    PermissionDenied,
    StreamAcquisitionFailed,
    StreamTerminatedUnexpectedly,
    EngineLoadFailed,
    EngineInitFailed,
    AudioGraphInitFailed,
    LocalStorageFailed,
    RemoteSyncFailed,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::UnsupportedEnvironment,
        ErrorKind::PermissionDenied,
        ErrorKind::StreamAcquisitionFailed,
        ErrorKind::StreamTerminatedUnexpectedly,
        ErrorKind::EngineLoadFailed,
        ErrorKind::EngineInitFailed,
        ErrorKind::AudioGraphInitFailed,
        ErrorKind::LocalStorageFailed,
        ErrorKind::RemoteSyncFailed,
        ErrorKind::Unknown,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedEnvironment => "unsupported_environment",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::StreamAcquisitionFailed => "stream_acquisition_failed",
            ErrorKind::StreamTerminatedUnexpectedly => "stream_terminated_unexpectedly",
            ErrorKind::EngineLoadFailed => "engine_load_failed",
            ErrorKind::EngineInitFailed => "engine_init_failed",
            ErrorKind::AudioGraphInitFailed => "audio_graph_init_failed",
            ErrorKind::LocalStorageFailed => "local_storage_failed",
            ErrorKind::RemoteSyncFailed => "remote_sync_failed",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Background sync failures are diagnostics only and never interrupt play.
    pub fn is_user_visible(self) -> bool {
        !matches!(self, ErrorKind::RemoteSyncFailed)
    }
}

pub fn remediation(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::UnsupportedEnvironment => {
            "This browser or device cannot record audio. Open the rally in an up-to-date browser such as Safari or Chrome."
        }
        ErrorKind::PermissionDenied => {
            "Microphone access is blocked. Allow microphone access for this site in your device settings, then try again."
        }
        ErrorKind::StreamAcquisitionFailed => {
            "The microphone could not be started. Close other apps that may be using it and try again."
        }
        ErrorKind::StreamTerminatedUnexpectedly => {
            "The microphone was disconnected. Check that it is still available and tap start again."
        }
        ErrorKind::EngineLoadFailed => {
            "The sound recognition module could not be downloaded. Check your network connection and try again."
        }
        ErrorKind::EngineInitFailed => {
            "The sound recognition module failed to start. Reload the page and try again."
        }
        ErrorKind::AudioGraphInitFailed => {
            "Audio processing could not be set up on this device. Reload the page and try again."
        }
        ErrorKind::LocalStorageFailed => {
            "Your progress could not be saved on this device and may be lost after reloading. Leave private browsing mode or free up storage."
        }
        ErrorKind::RemoteSyncFailed => {
            "Progress could not be backed up online. It is still saved on this device."
        }
        ErrorKind::Unknown => "Something went wrong. Please try again.",
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserNotice {
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: &'static str,
}

impl UserNotice {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remediation: remediation(kind),
        }
    }
}

pub fn present(kind: ErrorKind, message: impl Into<String>) -> Option<UserNotice> {
    if !kind.is_user_visible() {
        return None;
    }
    Some(UserNotice::new(kind, message))
}
