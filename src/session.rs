use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::config::EngineSettings;
use crate::engine::{DetectCallback, DetectionEvent, EngineError, EngineLoader, Recognizer};
use crate::error::{present, ErrorKind, UserNotice};
use crate::media::{
    AudioBackend, AudioConstraints, AudioGraph, MediaDevices, MediaError, MediaStream,
};

const DETECTION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Failed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("audio capture is not supported in this environment")]
    UnsupportedEnvironment,
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to acquire microphone stream: {0}")]
    StreamAcquisitionFailed(String),
    #[error("microphone stream ended unexpectedly")]
    StreamTerminated,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to initialise audio graph: {0}")]
    AudioGraphInitFailed(String),
    #[error("failed to acquire session state")]
    StatePoisoned,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::UnsupportedEnvironment => ErrorKind::UnsupportedEnvironment,
            SessionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SessionError::StreamAcquisitionFailed(_) => ErrorKind::StreamAcquisitionFailed,
            SessionError::StreamTerminated => ErrorKind::StreamTerminatedUnexpectedly,
            SessionError::Engine(error) => error.kind(),
            SessionError::AudioGraphInitFailed(_) => ErrorKind::AudioGraphInitFailed,
            SessionError::StatePoisoned => ErrorKind::Unknown,
        }
    }

    fn notice(&self) -> Option<UserNotice> {
        present(self.kind(), self.to_string())
    }
}

impl From<MediaError> for SessionError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::Unsupported(_) => SessionError::UnsupportedEnvironment,
            MediaError::PermissionDenied(reason) => SessionError::PermissionDenied(reason),
            MediaError::Acquisition(reason) => SessionError::StreamAcquisitionFailed(reason),
            MediaError::Graph(reason) => SessionError::AudioGraphInitFailed(reason),
        }
    }
}

fn graph_error(error: MediaError) -> SessionError {
    match error {
        MediaError::Graph(reason) => SessionError::AudioGraphInitFailed(reason),
        other => SessionError::AudioGraphInitFailed(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_recording: bool,
    pub last_detection: Option<DetectionEvent>,
    pub current_error: Option<UserNotice>,
    pub sample_rate_hz: Option<u32>,
}

/// Microphone stream, audio graph and recognizer held by one session. Released
/// in order: tracks, then graph, then recognizer.
#[derive(Default)]
struct SessionHandles {
    stream: Option<Arc<dyn MediaStream>>,
    graph: Option<Arc<dyn AudioGraph>>,
    recognizer: Option<Arc<dyn Recognizer>>,
    sample_rate_hz: u32,
}

impl SessionHandles {
    fn is_complete(&self) -> bool {
        self.stream.is_some() && self.graph.is_some() && self.recognizer.is_some()
    }

    async fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all_tracks();
        }
        if let Some(graph) = self.graph.take() {
            graph.close().await;
        }
        self.recognizer = None;
    }
}

impl Drop for SessionHandles {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all_tracks();
        }
        if let Some(graph) = self.graph.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        graph.close().await;
                    });
                }
                Err(_) => tracing::warn!("audio graph dropped outside a runtime; close skipped"),
            }
        }
    }
}

struct ControllerState {
    phase: SessionState,
    generation: u64,
    cancel_requested: bool,
    stream_ended_while_starting: bool,
    session: Option<SessionHandles>,
    current_error: Option<UserNotice>,
}

struct ControllerInner {
    media: Arc<dyn MediaDevices>,
    audio: Arc<dyn AudioBackend>,
    engine: Arc<dyn EngineLoader>,
    settings: EngineSettings,
    constraints: AudioConstraints,
    state: Mutex<ControllerState>,
    detections: broadcast::Sender<DetectionEvent>,
    last_detection: watch::Sender<Option<DetectionEvent>>,
}

impl ControllerInner {
    fn publish_detection(&self, generation: u64, event: DetectionEvent) {
        let active = self
            .state
            .lock()
            .map(|state| state.phase == SessionState::Recording && state.generation == generation)
            .unwrap_or(false);
        if !active {
            return;
        }

        tracing::debug!(tag = %event.detection_tag, position = event.position, "detection");
        self.last_detection.send_replace(Some(event.clone()));
        let _ = self.detections.send(event);
    }
}

/// Returns a start that never settled (its future was dropped) to `Idle`.
/// Declared before the handles so they are released first.
struct StartGuard {
    inner: Weak<ControllerInner>,
    generation: u64,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        if state.generation == self.generation && state.phase == SessionState::Starting {
            state.phase = SessionState::Idle;
            state.cancel_requested = false;
            state.stream_ended_while_starting = false;
            tracing::info!(generation = self.generation, "abandoned session start reset to idle");
        }
    }
}

enum StartSettlement {
    Fail(SessionError),
    Cancel,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        audio: Arc<dyn AudioBackend>,
        engine: Arc<dyn EngineLoader>,
        settings: EngineSettings,
        constraints: AudioConstraints,
    ) -> Self {
        let (detections, _) = broadcast::channel(DETECTION_CHANNEL_CAPACITY);
        let (last_detection, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControllerInner {
                media,
                audio,
                engine,
                settings,
                constraints,
                state: Mutex::new(ControllerState {
                    phase: SessionState::Idle,
                    generation: 0,
                    cancel_requested: false,
                    stream_ended_while_starting: false,
                    session: None,
                    current_error: None,
                }),
                detections,
                last_detection,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ControllerState>, SessionError> {
        self.inner
            .state
            .lock()
            .map_err(|_| SessionError::StatePoisoned)
    }

    fn build_status(&self, state: &ControllerState) -> SessionStatus {
        SessionStatus {
            state: state.phase,
            is_recording: state.phase == SessionState::Recording,
            last_detection: self.inner.last_detection.borrow().clone(),
            current_error: state.current_error.clone(),
            sample_rate_hz: state.session.as_ref().map(|session| session.sample_rate_hz),
        }
    }

    pub fn status(&self) -> Result<SessionStatus, SessionError> {
        let state = self.lock()?;
        Ok(self.build_status(&state))
    }

    pub fn state(&self) -> SessionState {
        self.lock()
            .map(|state| state.phase)
            .unwrap_or(SessionState::Failed)
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Recording
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.inner.detections.subscribe()
    }

    pub fn watch_last_detection(&self) -> watch::Receiver<Option<DetectionEvent>> {
        self.inner.last_detection.subscribe()
    }

    pub fn clear_error(&self) -> Result<SessionStatus, SessionError> {
        let mut state = self.lock()?;
        state.current_error = None;
        if state.phase == SessionState::Failed {
            state.phase = SessionState::Idle;
        }
        Ok(self.build_status(&state))
    }

    pub async fn toggle(&self) -> Result<SessionStatus, SessionError> {
        let phase = self.lock()?.phase;
        match phase {
            SessionState::Idle | SessionState::Failed => self.start().await,
            SessionState::Recording => self.stop().await,
            SessionState::Starting => {
                let mut state = self.lock()?;
                state.cancel_requested = true;
                Ok(self.build_status(&state))
            }
            SessionState::Stopping => self.status(),
        }
    }

    pub async fn start(&self) -> Result<SessionStatus, SessionError> {
        let generation = {
            let mut state = self.lock()?;
            if matches!(
                state.phase,
                SessionState::Starting | SessionState::Recording | SessionState::Stopping
            ) {
                return Ok(self.build_status(&state));
            }
            state.phase = SessionState::Starting;
            state.generation = state.generation.wrapping_add(1);
            state.cancel_requested = false;
            state.stream_ended_while_starting = false;
            state.current_error = None;
            state.generation
        };
        tracing::info!(generation, "starting recognition session");

        let _guard = StartGuard {
            inner: Arc::downgrade(&self.inner),
            generation,
        };
        let mut handles = SessionHandles::default();
        let acquired = self.acquire(&mut handles, generation).await;

        let settlement = {
            let mut state = self.lock()?;
            let superseded = state.generation != generation;
            match acquired {
                Err(error) => StartSettlement::Fail(error),
                Ok(()) if state.cancel_requested || superseded => StartSettlement::Cancel,
                Ok(()) if state.stream_ended_while_starting => {
                    StartSettlement::Fail(SessionError::StreamTerminated)
                }
                Ok(()) if !handles.is_complete() => StartSettlement::Fail(
                    SessionError::AudioGraphInitFailed("session resources incomplete".to_string()),
                ),
                Ok(()) => {
                    state.phase = SessionState::Recording;
                    state.session = Some(std::mem::take(&mut handles));
                    self.inner.last_detection.send_replace(None);
                    tracing::info!(generation, "recognition session recording");
                    return Ok(self.build_status(&state));
                }
            }
        };

        handles.release().await;

        let mut state = self.lock()?;
        let current = state.generation == generation;
        match settlement {
            StartSettlement::Cancel => {
                if current {
                    state.phase = SessionState::Idle;
                }
                tracing::info!(generation, "recognition session start cancelled");
                Ok(self.build_status(&state))
            }
            StartSettlement::Fail(error) => {
                if current {
                    state.phase = SessionState::Failed;
                    state.current_error = error.notice();
                }
                tracing::warn!(
                    generation,
                    kind = error.kind().as_label(),
                    %error,
                    "recognition session failed to start"
                );
                Err(error)
            }
        }
    }

    pub async fn stop(&self) -> Result<SessionStatus, SessionError> {
        let (generation, session) = {
            let mut state = self.lock()?;
            match state.phase {
                SessionState::Recording => {
                    state.phase = SessionState::Stopping;
                    (state.generation, state.session.take())
                }
                SessionState::Starting => {
                    state.cancel_requested = true;
                    return Ok(self.build_status(&state));
                }
                _ => return Ok(self.build_status(&state)),
            }
        };

        if let Some(mut session) = session {
            session.release().await;
        }

        let mut state = self.lock()?;
        if state.generation == generation && state.phase == SessionState::Stopping {
            state.phase = SessionState::Idle;
        }
        tracing::info!(generation, "recognition session stopped");
        Ok(self.build_status(&state))
    }

    async fn acquire(
        &self,
        handles: &mut SessionHandles,
        generation: u64,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        if !inner.media.is_supported() {
            return Err(SessionError::UnsupportedEnvironment);
        }

        let stream = inner.media.get_user_media(inner.constraints).await?;
        handles.stream = Some(stream.clone());
        self.watch_stream_end(&stream, generation);

        let graph = inner.audio.create_graph().map_err(graph_error)?;
        handles.sample_rate_hz = graph.sample_rate_hz();
        handles.graph = Some(graph.clone());

        let recognizer = inner.engine.load(graph.clone(), &inner.settings).await?;
        handles.recognizer = Some(recognizer.clone());
        recognizer.change_samplerate(handles.sample_rate_hz);
        recognizer.set_on_detect(self.detection_callback(generation));

        graph.connect(&stream, recognizer.node()).map_err(graph_error)?;
        Ok(())
    }

    fn detection_callback(&self, generation: u64) -> DetectCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event: DetectionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.publish_detection(generation, event);
            }
        })
    }

    fn watch_stream_end(&self, stream: &Arc<dyn MediaStream>, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        stream.on_track_ended(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                SessionController { inner }.on_stream_ended(generation);
            }
        }));
    }

    fn on_stream_ended(&self, generation: u64) {
        let session = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.generation != generation {
                return;
            }
            match state.phase {
                SessionState::Starting => {
                    state.stream_ended_while_starting = true;
                    return;
                }
                SessionState::Recording => {
                    state.phase = SessionState::Stopping;
                    state.session.take()
                }
                _ => return,
            }
        };
        tracing::warn!(generation, "microphone stream ended unexpectedly");

        let controller = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(mut session) = session {
                        session.release().await;
                    }
                    controller.mark_terminated(generation);
                });
            }
            Err(_) => {
                drop(session);
                controller.mark_terminated(generation);
            }
        }
    }

    fn mark_terminated(&self, generation: u64) {
        if let Ok(mut state) = self.inner.state.lock() {
            if state.generation == generation && state.phase == SessionState::Stopping {
                state.phase = SessionState::Idle;
                state.current_error = SessionError::StreamTerminated.notice();
            }
        }
    }
}
