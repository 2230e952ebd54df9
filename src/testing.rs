use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::config::EngineSettings;
use crate::engine::{DetectCallback, DetectionEvent, EngineError, EngineLoader, Recognizer};
use crate::media::{
    AudioBackend, AudioConstraints, AudioGraph, AudioNode, MediaDevices, MediaError, MediaStream,
    TrackEndedCallback,
};
use crate::remote::{AnonymousSession, ProgressRow, RemoteError, RemoteStore};
use crate::session::{SessionController, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    StopTracks,
    CloseGraph,
}

/// Release steps shared by a stream and graph, each tagged with the controller
/// state observed when it happened.
#[derive(Default)]
pub struct ReleaseLog {
    entries: Mutex<Vec<(Release, Option<SessionState>)>>,
    controller: Mutex<Option<SessionController>>,
}

impl ReleaseLog {
    pub fn observe(&self, controller: &SessionController) {
        *self.controller.lock().expect("controller lock") = Some(controller.clone());
    }

    pub fn entries(&self) -> Vec<(Release, Option<SessionState>)> {
        self.entries.lock().expect("entries lock").clone()
    }

    fn push(&self, step: Release) {
        let controller = self.controller.lock().expect("controller lock").clone();
        let state = controller.map(|controller| controller.state());
        self.entries.lock().expect("entries lock").push((step, state));
    }
}

#[derive(Default)]
pub struct FakeStream {
    stopped: AtomicBool,
    log: Arc<ReleaseLog>,
    ended_callbacks: Mutex<Vec<TrackEndedCallback>>,
}

impl FakeStream {
    pub fn end_externally(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let callbacks = self.ended_callbacks.lock().expect("callbacks lock");
        for callback in callbacks.iter() {
            callback();
        }
    }
}

impl MediaStream for FakeStream {
    fn stop_all_tracks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.log.push(Release::StopTracks);
    }

    fn live_track_count(&self) -> usize {
        if self.stopped.load(Ordering::SeqCst) {
            0
        } else {
            1
        }
    }

    fn on_track_ended(&self, callback: TrackEndedCallback) {
        self.ended_callbacks
            .lock()
            .expect("callbacks lock")
            .push(callback);
    }
}

#[derive(Default)]
pub struct FakeMediaDevices {
    unsupported: bool,
    failure: Mutex<Option<MediaError>>,
    gate: Option<Arc<Notify>>,
    streams: Mutex<Vec<Arc<FakeStream>>>,
    requests: AtomicUsize,
    last_constraints: Mutex<Option<AudioConstraints>>,
    log: Arc<ReleaseLog>,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::default()
        }
    }

    pub fn with_log(self, log: Arc<ReleaseLog>) -> Self {
        Self { log, ..self }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().expect("failure lock") = None;
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<Arc<FakeStream>> {
        self.streams.lock().expect("streams lock").clone()
    }

    pub fn last_constraints(&self) -> Option<AudioConstraints> {
        *self.last_constraints.lock().expect("constraints lock")
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    fn is_supported(&self) -> bool {
        !self.unsupported
    }

    async fn get_user_media(
        &self,
        constraints: AudioConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock().expect("constraints lock") = Some(constraints);

        if let Some(gate) = self.gate.clone() {
            gate.notified().await;
        }

        let failure = self.failure.lock().expect("failure lock").clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let stream = Arc::new(FakeStream {
            log: self.log.clone(),
            ..FakeStream::default()
        });
        self.streams
            .lock()
            .expect("streams lock")
            .push(stream.clone());
        Ok(stream)
    }
}

pub struct FakeGraph {
    sample_rate_hz: u32,
    fail_connect: bool,
    connected: AtomicBool,
    closed: AtomicBool,
    log: Arc<ReleaseLog>,
}

impl FakeGraph {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioGraph for FakeGraph {
    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn connect(
        &self,
        _stream: &Arc<dyn MediaStream>,
        _node: Arc<dyn AudioNode>,
    ) -> Result<(), MediaError> {
        if self.fail_connect {
            return Err(MediaError::Graph("createMediaStreamSource failed".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.push(Release::CloseGraph);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeAudioBackend {
    sample_rate_hz: u32,
    fail_create: bool,
    fail_connect: bool,
    graphs: Mutex<Vec<Arc<FakeGraph>>>,
    log: Arc<ReleaseLog>,
}

impl FakeAudioBackend {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            fail_create: false,
            fail_connect: false,
            graphs: Mutex::new(Vec::new()),
            log: Arc::default(),
        }
    }

    pub fn with_log(self, log: Arc<ReleaseLog>) -> Self {
        Self { log, ..self }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::new(44_100)
        }
    }

    pub fn failing_connect(sample_rate_hz: u32) -> Self {
        Self {
            fail_connect: true,
            ..Self::new(sample_rate_hz)
        }
    }

    pub fn graphs(&self) -> Vec<Arc<FakeGraph>> {
        self.graphs.lock().expect("graphs lock").clone()
    }
}

impl AudioBackend for FakeAudioBackend {
    fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, MediaError> {
        if self.fail_create {
            return Err(MediaError::Graph("AudioContext unavailable".to_string()));
        }
        let graph = Arc::new(FakeGraph {
            sample_rate_hz: self.sample_rate_hz,
            fail_connect: self.fail_connect,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        });
        self.graphs.lock().expect("graphs lock").push(graph.clone());
        Ok(graph)
    }
}

#[derive(Default)]
pub struct FakeNode {
    samples: AtomicUsize,
}

impl AudioNode for FakeNode {
    fn process(&self, samples: &[f32]) {
        self.samples.fetch_add(samples.len(), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeRecognizer {
    sample_rate_hz: AtomicU32,
    callback: Mutex<Option<DetectCallback>>,
    node: Arc<FakeNode>,
}

impl FakeRecognizer {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_hz.load(Ordering::SeqCst)
    }

    pub fn emit(&self, tag: &str, position: f64) {
        let callback = self.callback.lock().expect("callback lock").clone();
        if let Some(callback) = callback {
            callback(DetectionEvent {
                detection_tag: tag.to_string(),
                position,
            });
        }
    }
}

impl Recognizer for FakeRecognizer {
    fn change_samplerate(&self, sample_rate_hz: u32) {
        self.sample_rate_hz.store(sample_rate_hz, Ordering::SeqCst);
    }

    fn set_on_detect(&self, callback: DetectCallback) {
        *self.callback.lock().expect("callback lock") = Some(callback);
    }

    fn node(&self) -> Arc<dyn AudioNode> {
        self.node.clone()
    }
}

#[derive(Default)]
pub struct FakeEngine {
    failure: Option<EngineError>,
    loads: AtomicUsize,
    recognizers: Mutex<Vec<Arc<FakeRecognizer>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: EngineError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn recognizers(&self) -> Vec<Arc<FakeRecognizer>> {
        self.recognizers.lock().expect("recognizers lock").clone()
    }
}

#[async_trait]
impl EngineLoader for FakeEngine {
    async fn load(
        &self,
        _graph: Arc<dyn AudioGraph>,
        _settings: &EngineSettings,
    ) -> Result<Arc<dyn Recognizer>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let recognizer = Arc::new(FakeRecognizer::default());
        self.recognizers
            .lock()
            .expect("recognizers lock")
            .push(recognizer.clone());
        Ok(recognizer)
    }
}

#[derive(Default)]
pub struct FakeRemote {
    fail_sign_in: AtomicBool,
    fail_upserts: AtomicBool,
    sign_ins: AtomicUsize,
    sign_outs: AtomicUsize,
    upserts: Mutex<Vec<ProgressRow>>,
    rows: Mutex<HashMap<String, ProgressRow>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_sign_in(&self, fail: bool) {
        self.fail_sign_in.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn sign_in_count(&self) -> usize {
        self.sign_ins.load(Ordering::SeqCst)
    }

    pub fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    pub fn upserts(&self) -> Vec<ProgressRow> {
        self.upserts.lock().expect("upserts lock").clone()
    }

    pub fn seed_row(&self, row: ProgressRow) {
        self.rows
            .lock()
            .expect("rows lock")
            .insert(row.user_id.clone(), row);
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn sign_in_anonymously(&self) -> Result<AnonymousSession, RemoteError> {
        if self.fail_sign_in.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("offline".to_string()));
        }
        let count = self.sign_ins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AnonymousSession {
            user_id: format!("user-{count}"),
        })
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_progress(&self, row: &ProgressRow) -> Result<(), RemoteError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("offline".to_string()));
        }
        self.upserts.lock().expect("upserts lock").push(row.clone());
        self.rows
            .lock()
            .expect("rows lock")
            .insert(row.user_id.clone(), row.clone());
        Ok(())
    }

    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressRow>, RemoteError> {
        Ok(self.rows.lock().expect("rows lock").get(user_id).cloned())
    }
}
