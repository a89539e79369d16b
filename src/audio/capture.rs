//! Continuous audio capture into the frame queue
//!
//! The cpal stream is not Send, so it lives on a dedicated capture thread.
//! The data callback only converts, downmixes and pushes; it never waits on
//! the processing side.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::audio::frame::Frame;
use crate::audio::ingest::AudioData;
use crate::audio::queue::{FrameQueue, PushOutcome};

/// How long `start` waits for the capture thread to open the device
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream rebuild attempts after a mid-stream failure
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

const RECOVERY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Requested capture format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Mono samples per delivered frame
    pub frame_size: usize,
    /// Input device name; the host default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            sample_rate: 16000,
            channels: 1,
            frame_size: 1024,
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Stopped,
    Running,
    /// Stream failed mid-capture; recovery failed or is in progress
    Degraded,
}

/// Out-of-band notifications from the capture path
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Started { sample_rate: u32, channels: u16 },
    StreamError(String),
    Recovered,
    Failed(String),
    Stopped,
}

pub type CaptureEventHandler = Arc<dyn Fn(&CaptureEvent) + Send + Sync>;

/// Anything that can feed frames into the queue
pub trait FrameSource: Send {
    /// Begin delivering frames. Calling while running is a no-op.
    fn start(&mut self, queue: Arc<FrameQueue>) -> Result<(), CaptureError>;

    /// Halt delivery; no frame is pushed after this returns
    fn stop(&mut self);

    fn state(&self) -> SourceState;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Splits interleaved callback buffers into fixed-size mono frames
struct FrameAssembler {
    channels: usize,
    frame_size: usize,
    sample_rate: u32,
    /// Stream time of the first sample this assembler sees
    time_offset: f64,
    produced: u64,
    pending: Vec<f32>,
    queue: Arc<FrameQueue>,
    accepting: Arc<AtomicBool>,
}

impl FrameAssembler {
    fn new(
        channels: u16,
        frame_size: usize,
        sample_rate: u32,
        time_offset: f64,
        queue: Arc<FrameQueue>,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        let frame_size = frame_size.max(1);
        FrameAssembler {
            channels: channels.max(1) as usize,
            frame_size,
            sample_rate,
            time_offset,
            produced: 0,
            pending: Vec::with_capacity(frame_size),
            queue,
            accepting,
        }
    }

    fn push_interleaved<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }

        for chunk in data.chunks(self.channels) {
            let sum: f32 = chunk.iter().map(|&s| f32::from_sample(s)).sum();
            self.pending.push(sum / chunk.len() as f32);

            if self.pending.len() == self.frame_size {
                let timestamp = self.time_offset + self.produced as f64 / self.sample_rate as f64;
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.produced += samples.len() as u64;

                if self.queue.push(Frame::new(samples, self.sample_rate, timestamp))
                    == PushOutcome::DroppedOldest
                {
                    log::trace!("Frame queue full, dropped oldest frame");
                }
            }
        }
    }
}

/// Microphone capture through cpal
pub struct AudioSource {
    config: DeviceConfig,
    state: Arc<Mutex<SourceState>>,
    stop_signal: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    handler: Option<CaptureEventHandler>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource {
    pub fn new(config: DeviceConfig) -> Self {
        AudioSource {
            config,
            state: Arc::new(Mutex::new(SourceState::Stopped)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(false)),
            handler: None,
            thread: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Receive capture events (stream errors, recovery) on the capture thread
    pub fn set_event_handler(&mut self, handler: CaptureEventHandler) {
        self.handler = Some(handler);
    }

    /// Names of the available input devices
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Audio capture thread panicked");
            }
        }
    }
}

impl FrameSource for AudioSource {
    fn start(&mut self, queue: Arc<FrameQueue>) -> Result<(), CaptureError> {
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        // A previous capture thread that gave up after a stream failure
        self.join_thread();

        self.stop_signal.store(false, Ordering::SeqCst);
        self.accepting.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        let ctx = CaptureContext {
            config: self.config.clone(),
            queue,
            state: Arc::clone(&self.state),
            stop_signal: Arc::clone(&self.stop_signal),
            accepting: Arc::clone(&self.accepting),
            handler: self.handler.clone(),
        };

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(ctx, ready_tx))
            .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {}", e)))?;
        self.thread = Some(handle);

        let result = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Device(
                "timed out waiting for the input device".to_string(),
            )),
        };

        if let Err(e) = &result {
            log::error!("Audio capture failed to start: {}", e);
            self.stop();
        }
        result
    }

    fn stop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.stop_signal.store(true, Ordering::SeqCst);
        self.join_thread();
        *lock(&self.state) = SourceState::Stopped;
    }

    fn state(&self) -> SourceState {
        *lock(&self.state)
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureContext {
    config: DeviceConfig,
    queue: Arc<FrameQueue>,
    state: Arc<Mutex<SourceState>>,
    stop_signal: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    handler: Option<CaptureEventHandler>,
}

impl CaptureContext {
    fn emit(&self, event: CaptureEvent) {
        if let Some(handler) = &self.handler {
            handler(&event);
        }
    }

    fn set_state(&self, state: SourceState) {
        *lock(&self.state) = state;
    }
}

/// Owns the cpal stream for the lifetime of one capture session
fn run_capture(ctx: CaptureContext, ready: mpsc::Sender<Result<(), CaptureError>>) {
    let started = Instant::now();
    let failed = Arc::new(AtomicBool::new(false));
    let last_error = Arc::new(Mutex::new(None::<String>));

    let (stream, rate, channels) = match open_stream(&ctx, 0.0, &failed, &last_error) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = Some(stream);

    ctx.set_state(SourceState::Running);
    let _ = ready.send(Ok(()));
    log::info!("Audio capture started: {} Hz, {} channel(s)", rate, channels);
    ctx.emit(CaptureEvent::Started {
        sample_rate: rate,
        channels,
    });

    while !ctx.stop_signal.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));

        if !failed.swap(false, Ordering::SeqCst) {
            continue;
        }

        let message = lock(&last_error)
            .take()
            .unwrap_or_else(|| "unknown stream error".to_string());
        log::warn!("Audio stream failed, attempting recovery: {}", message);
        ctx.set_state(SourceState::Degraded);
        ctx.emit(CaptureEvent::StreamError(message));

        // Dropping the stream guarantees its callbacks have finished
        drop(stream.take());

        for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
            if ctx.stop_signal.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(RECOVERY_BACKOFF * attempt);

            let offset = started.elapsed().as_secs_f64();
            match open_stream(&ctx, offset, &failed, &last_error) {
                Ok((rebuilt, _, _)) => {
                    stream = Some(rebuilt);
                    break;
                }
                Err(e) => log::warn!("Recovery attempt {} failed: {}", attempt, e),
            }
        }

        if stream.is_some() {
            log::info!("Audio stream recovered");
            ctx.set_state(SourceState::Running);
            ctx.emit(CaptureEvent::Recovered);
        } else {
            if !ctx.stop_signal.load(Ordering::SeqCst) {
                log::error!("Audio stream could not be recovered; capture is degraded");
                ctx.emit(CaptureEvent::Failed(
                    "stream recovery attempts exhausted".to_string(),
                ));
            }
            return;
        }
    }

    drop(stream);
    ctx.set_state(SourceState::Stopped);
    log::info!("Audio capture stopped");
    ctx.emit(CaptureEvent::Stopped);
}

fn open_stream(
    ctx: &CaptureContext,
    time_offset: f64,
    failed: &Arc<AtomicBool>,
    last_error: &Arc<Mutex<Option<String>>>,
) -> Result<(cpal::Stream, u32, u16), CaptureError> {
    let host = cpal::default_host();

    let device = match &ctx.config.device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false)),
        None => host.default_input_device(),
    }
    .ok_or_else(|| CaptureError::Device("no input device available".to_string()))?;

    let requested = SampleRate(ctx.config.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Device(e.to_string()))?
        .find(|c| {
            c.channels() == ctx.config.channels
                && c.min_sample_rate() <= requested
                && c.max_sample_rate() >= requested
        })
        .map(|c| c.with_sample_rate(requested));

    let supported = match supported {
        Some(config) => config,
        None => {
            let fallback = device
                .default_input_config()
                .map_err(|e| CaptureError::Device(e.to_string()))?;
            log::warn!(
                "Requested {} Hz / {} ch not supported, using device default {} Hz / {} ch",
                ctx.config.sample_rate,
                ctx.config.channels,
                fallback.sample_rate().0,
                fallback.channels()
            );
            fallback
        }
    };

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.config();
    let rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;

    let assembler = FrameAssembler::new(
        channels,
        ctx.config.frame_size,
        rate,
        time_offset,
        Arc::clone(&ctx.queue),
        Arc::clone(&ctx.accepting),
    );

    let failed = Arc::clone(failed);
    let last_error = Arc::clone(last_error);
    let on_error = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        *lock(&last_error) = Some(err.to_string());
        failed.store(true, Ordering::SeqCst);
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32, _>(&device, &stream_config, assembler, on_error),
        SampleFormat::I16 => build_stream::<i16, _>(&device, &stream_config, assembler, on_error),
        SampleFormat::U16 => build_stream::<u16, _>(&device, &stream_config, assembler, on_error),
        other => Err(CaptureError::Device(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    Ok((stream, rate, channels))
}

fn build_stream<T, E>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut assembler: FrameAssembler,
    on_error: E,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
    E: FnMut(cpal::StreamError) + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| assembler.push_interleaved(data),
            on_error,
            None,
        )
        .map_err(|e| CaptureError::Device(e.to_string()))
}

/// Plays in-memory audio into the queue as fixed-size frames.
/// Used for file replay and tests; optionally paced in real time.
pub struct SyntheticSource {
    audio: Arc<AudioData>,
    frame_size: usize,
    realtime: bool,
    state: Arc<Mutex<SourceState>>,
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32, frame_size: usize) -> Self {
        SyntheticSource {
            audio: Arc::new(AudioData {
                samples,
                sample_rate,
            }),
            frame_size: frame_size.max(1),
            realtime: false,
            state: Arc::new(Mutex::new(SourceState::Stopped)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn from_audio(audio: AudioData, frame_size: usize) -> Self {
        Self::new(audio.samples, audio.sample_rate, frame_size)
    }

    /// Sleep one frame duration between pushes
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// True once every frame has been pushed
    pub fn is_exhausted(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self, queue: Arc<FrameQueue>) -> Result<(), CaptureError> {
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if self.audio.sample_rate == 0 {
            return Err(CaptureError::Device("synthetic source has no sample rate".to_string()));
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        *lock(&self.state) = SourceState::Running;

        let audio = Arc::clone(&self.audio);
        let frame_size = self.frame_size;
        let realtime = self.realtime;
        let state = Arc::clone(&self.state);
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || {
                let rate = audio.sample_rate;
                let frame_duration = Duration::from_secs_f64(frame_size as f64 / rate as f64);

                for (i, chunk) in audio.samples.chunks(frame_size).enumerate() {
                    if stop_signal.load(Ordering::SeqCst) {
                        break;
                    }
                    let timestamp = (i * frame_size) as f64 / rate as f64;
                    queue.push(Frame::new(chunk.to_vec(), rate, timestamp));

                    if realtime {
                        thread::sleep(frame_duration);
                    }
                }
                *lock(&state) = SourceState::Stopped;
            })
            .map_err(|e| CaptureError::Device(format!("failed to spawn source thread: {}", e)))?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        *lock(&self.state) = SourceState::Stopped;
    }

    fn state(&self) -> SourceState {
        *lock(&self.state)
    }
}
