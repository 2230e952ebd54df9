#[cfg(feature = "desktop")]
pub use native::{input_device_available, CpalAudioBackend, CpalMediaDevices};

pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / i16::MAX as f32
}

pub fn u16_to_f32(sample: u16) -> f32 {
    (f32::from(sample) / u16::MAX as f32) * 2.0 - 1.0
}

pub fn pcm_i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(i16_to_f32).collect()
}

pub fn downmix<T: Copy>(input: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    let channels = channels.max(1);
    input
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|sample| to_f32(*sample)).sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(feature = "desktop")]
mod native {
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::SampleFormat;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tokio::sync::oneshot;

    use super::{downmix, i16_to_f32, u16_to_f32};
    use crate::media::{
        AudioBackend, AudioConstraints, AudioGraph, AudioNode, MediaDevices, MediaError,
        MediaStream, TrackEndedCallback,
    };

    const FRAME_QUEUE: usize = 64;
    const PUMP_POLL: Duration = Duration::from_millis(100);

    pub fn input_device_available() -> Result<bool, String> {
        let host = cpal::default_host();
        if host.default_input_device().is_some() {
            return Ok(true);
        }
        host.input_devices()
            .map(|mut devices| devices.next().is_some())
            .map_err(|error| format!("failed to enumerate input devices: {error}"))
    }

    fn default_input_device() -> Result<cpal::Device, MediaError> {
        cpal::default_host()
            .default_input_device()
            .ok_or_else(|| MediaError::Acquisition("no input microphone is available".to_string()))
    }

    type EndedCallbacks = Arc<Mutex<Vec<TrackEndedCallback>>>;

    fn fire_ended(live: &AtomicBool, callbacks: &EndedCallbacks) {
        if !live.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(callbacks) = callbacks.lock() {
            for callback in callbacks.iter() {
                callback();
            }
        }
    }

    /// A cpal input stream owned by a dedicated thread, since cpal streams cannot
    /// cross threads.
    pub struct CpalStream {
        live: Arc<AtomicBool>,
        stop_tx: Mutex<Option<mpsc::Sender<()>>>,
        frames: Mutex<Option<Receiver<Vec<f32>>>>,
        ended: EndedCallbacks,
    }

    impl MediaStream for CpalStream {
        fn stop_all_tracks(&self) {
            self.live.store(false, Ordering::SeqCst);
            if let Some(stop_tx) = self.stop_tx.lock().ok().and_then(|mut tx| tx.take()) {
                let _ = stop_tx.send(());
            }
        }

        fn live_track_count(&self) -> usize {
            usize::from(self.live.load(Ordering::SeqCst))
        }

        fn on_track_ended(&self, callback: TrackEndedCallback) {
            if let Ok(mut callbacks) = self.ended.lock() {
                callbacks.push(callback);
            }
        }

        fn take_frames(&self) -> Option<Receiver<Vec<f32>>> {
            self.frames.lock().ok().and_then(|mut frames| frames.take())
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.stop_all_tracks();
        }
    }

    fn build_stream(
        frame_tx: SyncSender<Vec<f32>>,
        live: Arc<AtomicBool>,
        ended: EndedCallbacks,
    ) -> Result<cpal::Stream, MediaError> {
        let device = default_input_device()?;
        let supported = device
            .default_input_config()
            .map_err(|error| MediaError::Acquisition(format!("no usable input config: {error}")))?;
        let sample_format = supported.sample_format();
        let config = supported.config();
        let channels = usize::from(config.channels.max(1));

        let error_callback = move |error: cpal::StreamError| {
            tracing::warn!(%error, "microphone stream error");
            fire_ended(&live, &ended);
        };
        let build_error =
            |error: cpal::BuildStreamError| MediaError::Acquisition(error.to_string());

        let stream = match sample_format {
            SampleFormat::F32 => device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _| {
                        let _ = frame_tx.try_send(downmix(data, channels, |sample| sample));
                    },
                    error_callback,
                    None,
                )
                .map_err(build_error)?,
            SampleFormat::I16 => device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _| {
                        let _ = frame_tx.try_send(downmix(data, channels, i16_to_f32));
                    },
                    error_callback,
                    None,
                )
                .map_err(build_error)?,
            SampleFormat::U16 => device
                .build_input_stream(
                    &config,
                    move |data: &[u16], _| {
                        let _ = frame_tx.try_send(downmix(data, channels, u16_to_f32));
                    },
                    error_callback,
                    None,
                )
                .map_err(build_error)?,
            other => {
                return Err(MediaError::Unsupported(format!(
                    "unsupported input sample format: {other:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|error| MediaError::Acquisition(format!("failed to start capture: {error}")))?;
        Ok(stream)
    }

    #[derive(Default)]
    pub struct CpalMediaDevices;

    impl CpalMediaDevices {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl MediaDevices for CpalMediaDevices {
        fn is_supported(&self) -> bool {
            input_device_available().unwrap_or(false)
        }

        async fn get_user_media(
            &self,
            constraints: AudioConstraints,
        ) -> Result<Arc<dyn MediaStream>, MediaError> {
            tracing::debug!(?constraints, "native capture applies the host's own processing");

            let live = Arc::new(AtomicBool::new(true));
            let ended: EndedCallbacks = Arc::new(Mutex::new(Vec::new()));
            let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE);
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let (ready_tx, ready_rx) = oneshot::channel();

            let thread_live = live.clone();
            let thread_ended = ended.clone();
            thread::Builder::new()
                .name("stamp-rally-capture".to_string())
                .spawn(move || match build_stream(frame_tx, thread_live, thread_ended) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                    }
                })
                .map_err(|error| MediaError::Acquisition(error.to_string()))?;

            ready_rx
                .await
                .map_err(|_| MediaError::Acquisition("capture thread exited".to_string()))??;

            Ok(Arc::new(CpalStream {
                live,
                stop_tx: Mutex::new(Some(stop_tx)),
                frames: Mutex::new(Some(frame_rx)),
                ended,
            }))
        }
    }

    pub struct NativeAudioGraph {
        sample_rate_hz: u32,
        closed: Arc<AtomicBool>,
        pump: Mutex<Option<JoinHandle<()>>>,
    }

    #[async_trait]
    impl AudioGraph for NativeAudioGraph {
        fn sample_rate_hz(&self) -> u32 {
            self.sample_rate_hz
        }

        fn connect(
            &self,
            stream: &Arc<dyn MediaStream>,
            node: Arc<dyn AudioNode>,
        ) -> Result<(), MediaError> {
            if self.is_closed() {
                return Err(MediaError::Graph("graph already closed".to_string()));
            }
            let frames = stream
                .take_frames()
                .ok_or_else(|| MediaError::Graph("stream has no capturable frames".to_string()))?;
            let closed = self.closed.clone();
            let pump = thread::Builder::new()
                .name("stamp-rally-pump".to_string())
                .spawn(move || {
                    while !closed.load(Ordering::SeqCst) {
                        match frames.recv_timeout(PUMP_POLL) {
                            Ok(frame) => node.process(&frame),
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .map_err(|error| MediaError::Graph(error.to_string()))?;

            let mut slot = self
                .pump
                .lock()
                .map_err(|_| MediaError::Graph("pump lock poisoned".to_string()))?;
            *slot = Some(pump);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            let pump = self.pump.lock().ok().and_then(|mut pump| pump.take());
            if let Some(pump) = pump {
                let _ = tokio::task::spawn_blocking(move || pump.join()).await;
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub struct CpalAudioBackend;

    impl CpalAudioBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioBackend for CpalAudioBackend {
        fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, MediaError> {
            let config = default_input_device()
                .map_err(|error| MediaError::Graph(error.to_string()))?
                .default_input_config()
                .map_err(|error| MediaError::Graph(format!("no usable input config: {error}")))?;
            Ok(Arc::new(NativeAudioGraph {
                sample_rate_hz: config.sample_rate().0,
                closed: Arc::new(AtomicBool::new(false)),
                pump: Mutex::new(None),
            }))
        }
    }
}
