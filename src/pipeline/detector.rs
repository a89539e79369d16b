// Detector facade
// Wires capture, processing, triggers, collection, training and the model registry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;

use crate::audio::capture::{AudioSource, CaptureError, CaptureEvent, FrameSource, SourceState};
use crate::audio::features::FeatureExtractor;
use crate::audio::queue::FrameQueue;
use crate::config::{ConfigError, DetectorConfig};
use crate::detection::classifier::{ClassifierEngine, ModelInfo};
use crate::detection::trigger::{CallbackRegistry, CallbackResult};
use crate::detection::types::{ClassScope, ConfidenceScore, TriggerEvent};
use crate::pipeline::processor::FrameProcessor;
use crate::state::models::{ActiveModelRecord, ArtifactRecord, Sample, SampleRecord};
use crate::state::registry::{LoadFailure, ModelRegistry, RegistryError};
use crate::state::store::{Store, StoreError};
use crate::training::collector::{CollectorError, SampleCollector};
use crate::training::trainer::{TrainingJob, TrainingManager, TrainingParams};

/// How long the processing loop waits for a frame before rechecking state
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Collection error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Unknown class scope: {0}")]
    UnknownScope(ClassScope),

    #[error("Invalid detector state: {0}")]
    InvalidState(String),

    #[error("Failed to spawn processing thread: {0}")]
    Thread(String),
}

pub type DetectorResult<T> = Result<T, DetectorError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The public surface of the detection pipeline.
///
/// Trigger callbacks run on the processing thread after the processor lock
/// is released, so a callback may call back into the detector (including
/// `stop()`).
pub struct Detector {
    config: DetectorConfig,
    store: Store,
    registry: Arc<ModelRegistry>,
    engine: Arc<ClassifierEngine>,
    processor: Arc<Mutex<FrameProcessor>>,
    callbacks: Arc<CallbackRegistry>,
    queue: Arc<FrameQueue>,
    source: Mutex<Box<dyn FrameSource>>,
    trainer: TrainingManager,
    running: AtomicBool,
    // Serializes start and stop
    lifecycle: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Cleared only after the processing thread has been joined
    worker_thread: Mutex<Option<ThreadId>>,
}

impl Detector {
    /// Open the store under the configured data root and use `source` as input
    pub fn new(config: DetectorConfig, source: Box<dyn FrameSource>) -> DetectorResult<Self> {
        config.validate()?;
        let store = Store::open(config.data_root()?)?;
        Self::with_store(config, store, source)
    }

    /// Capture from the configured microphone
    pub fn with_microphone(config: DetectorConfig) -> DetectorResult<Self> {
        let mut source = AudioSource::new(config.audio.device_config());
        source.set_event_handler(Arc::new(|event: &CaptureEvent| match event {
            CaptureEvent::StreamError(e) => log::warn!("Capture stream error: {}", e),
            CaptureEvent::Failed(e) => log::error!("Capture failed: {}", e),
            other => log::debug!("Capture event: {:?}", other),
        }));
        Self::new(config, Box::new(source))
    }

    pub fn with_store(config: DetectorConfig, store: Store, source: Box<dyn FrameSource>) -> DetectorResult<Self> {
        config.validate()?;
        let scopes = config.scopes();

        let engine = Arc::new(ClassifierEngine::with_baselines(&config.owner, &scopes));
        let registry = Arc::new(ModelRegistry::new(
            store.clone(),
            Arc::clone(&engine),
            config.owner.clone(),
        ));
        registry.restore(&config.owner, &scopes)?;

        let extractor = FeatureExtractor::new();
        let collector = SampleCollector::new(store.clone(), &config.owner, config.collection.clone());
        let processor = FrameProcessor::new(&config, extractor.clone(), Arc::clone(&engine), collector);

        let mut trainer = TrainingManager::new(Arc::clone(&registry), extractor);
        for (scope, scope_config) in &config.class_scopes {
            trainer.set_window_duration(scope.clone(), scope_config.window_duration);
        }

        log::info!(
            "Detector ready for {} with scopes [{}]",
            config.owner,
            scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Detector {
            queue: Arc::new(FrameQueue::new(config.audio.queue_capacity)),
            config,
            store,
            registry,
            engine,
            processor: Arc::new(Mutex::new(processor)),
            callbacks: Arc::new(CallbackRegistry::new()),
            source: Mutex::new(source),
            trainer,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ClassifierEngine> {
        &self.engine
    }

    /// Invoke `callback` each time `class_scope` fires
    pub fn register_trigger_callback<F>(&self, class_scope: &ClassScope, callback: F) -> DetectorResult<()>
    where
        F: Fn(&TriggerEvent) -> CallbackResult + Send + Sync + 'static,
    {
        if !self.config.class_scopes.contains_key(class_scope) {
            return Err(DetectorError::UnknownScope(class_scope.clone()));
        }
        self.callbacks.register(class_scope.clone(), callback);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start capture and processing. Idempotent.
    pub fn start(&self) -> DetectorResult<()> {
        if self.on_worker_thread() {
            return Err(DetectorError::InvalidState(
                "cannot restart the detector from a trigger callback".to_string(),
            ));
        }

        let _lifecycle = lock(&self.lifecycle);
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        // A loop stopped from inside a callback is still ours to join
        self.join_worker();

        lock(&self.processor).reset_stream();
        self.queue.clear();
        self.queue.reopen();

        let queue = Arc::clone(&self.queue);
        let processor = Arc::clone(&self.processor);
        let callbacks = Arc::clone(&self.callbacks);
        let handle = thread::Builder::new()
            .name("detector".to_string())
            .spawn(move || run_processing(queue, processor, callbacks))
            .map_err(|e| DetectorError::Thread(e.to_string()))?;
        *lock(&self.worker_thread) = Some(handle.thread().id());
        *lock(&self.worker) = Some(handle);
        self.running.store(true, Ordering::SeqCst);

        let started = lock(&self.source).start(Arc::clone(&self.queue));
        if let Err(e) = started {
            self.running.store(false, Ordering::SeqCst);
            self.queue.close();
            self.join_worker();
            return Err(e.into());
        }

        log::info!("Detector started");
        Ok(())
    }

    /// Stop capture and processing. Frames already queued are processed
    /// first and no callback runs after this returns. Called from a
    /// callback, the loop exits once the current frame is done. Idempotent.
    pub fn stop(&self) {
        if self.on_worker_thread() {
            // Never wait on the lifecycle lock here: a stop in progress may
            // be joining this very thread
            if self.running.swap(false, Ordering::SeqCst) {
                lock(&self.source).stop();
                self.queue.close();
                log::info!("Detector stopped from a trigger callback");
            }
            return;
        }

        let _lifecycle = lock(&self.lifecycle);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        lock(&self.source).stop();
        self.queue.close();
        self.join_worker();

        lock(&self.processor).finish();
        log::info!("Detector stopped ({} frames dropped)", self.queue.dropped());
    }

    fn on_worker_thread(&self) -> bool {
        *lock(&self.worker_thread) == Some(thread::current().id())
    }

    /// Join the processing thread. Until the join completes a callback still
    /// running on it is recognized as the worker, so its `stop()` never
    /// waits on the lifecycle lock held by the joining caller.
    fn join_worker(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Detector processing thread panicked");
            }
        }
        *lock(&self.worker_thread) = None;
    }

    pub fn start_collecting(&self, label: &str) -> DetectorResult<()> {
        lock(&self.processor).collector_mut().start_collecting(label)?;
        Ok(())
    }

    /// Stop collecting and return the samples persisted during the session
    pub fn stop_collecting(&self) -> Vec<SampleRecord> {
        lock(&self.processor).collector_mut().stop_collecting()
    }

    pub fn is_collecting(&self) -> bool {
        lock(&self.processor).collector().is_collecting()
    }

    /// Recent scores for a scope, oldest first
    pub fn get_confidence_history(&self, class_scope: &ClassScope) -> Vec<ConfidenceScore> {
        lock(&self.processor).history(class_scope)
    }

    /// Train a new model in the background; see `TrainingManager::train_async`
    pub fn train_async(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        samples: Vec<Sample>,
        params: TrainingParams,
    ) -> TrainingJob {
        self.trainer.train_async(owner, class_scope, samples, params)
    }

    /// Train from every stored sample of `owner`
    pub fn train_from_store(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        params: TrainingParams,
    ) -> DetectorResult<TrainingJob> {
        let samples = self.store.load_samples(owner)?;
        Ok(self.train_async(owner, class_scope, samples, params))
    }

    pub fn get_active_model_info(&self, owner: &str, class_scope: &ClassScope) -> DetectorResult<ModelInfo> {
        Ok(self.registry.get_active_model_info(owner, class_scope)?)
    }

    pub fn list_samples(&self, owner: &str, label: Option<&str>) -> DetectorResult<Vec<SampleRecord>> {
        Ok(self.store.list_samples(owner, label)?)
    }

    /// Sample count per label for `owner`
    pub fn sample_counts(&self, owner: &str) -> DetectorResult<Vec<(String, u64)>> {
        Ok(self.store.sample_counts(owner)?)
    }

    /// Persisted activations of `owner`, one per class scope
    pub fn active_models(&self, owner: &str) -> DetectorResult<Vec<ActiveModelRecord>> {
        Ok(self.store.active_models(owner)?)
    }

    pub fn list_model_versions(&self, owner: &str, class_scope: &ClassScope) -> DetectorResult<Vec<ArtifactRecord>> {
        Ok(self.registry.list_versions(owner, class_scope)?)
    }

    /// Activate a published version (0 for the baseline)
    pub fn activate_model_version(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        version: u32,
    ) -> DetectorResult<ModelInfo> {
        Ok(self.registry.activate(owner, class_scope, version)?)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn source_state(&self) -> SourceState {
        lock(&self.source).state()
    }

    pub fn recent_load_errors(&self) -> Vec<LoadFailure> {
        self.registry.recent_load_errors()
    }

    pub fn callback_failures(&self) -> u64 {
        self.callbacks.failures()
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_processing(queue: Arc<FrameQueue>, processor: Arc<Mutex<FrameProcessor>>, callbacks: Arc<CallbackRegistry>) {
    log::debug!("Processing loop started");

    loop {
        let Some(frame) = queue.pop_timeout(POLL_INTERVAL) else {
            if queue.is_closed() {
                break;
            }
            continue;
        };

        let events = lock(&processor).process_frame(&frame);
        for event in &events {
            callbacks.dispatch(event);
        }
    }

    log::debug!("Processing loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::SyntheticSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    const RATE: u32 = 16000;

    fn config() -> DetectorConfig {
        let mut config = DetectorConfig::default();
        config.owner = "alice".to_string();
        config.audio.queue_capacity = 4096;
        config
    }

    fn detector(dir: &TempDir, audio: Vec<f32>) -> Arc<Detector> {
        let store = Store::open(dir.path()).unwrap();
        let source = SyntheticSource::new(audio, RATE, 1024);
        Arc::new(Detector::with_store(config(), store, Box::new(source)).unwrap())
    }

    fn tone(seconds: f64) -> Vec<f32> {
        (0..(seconds * RATE as f64) as usize)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
            .collect()
    }

    fn run_to_end(detector: &Detector) {
        detector.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while detector.source_state() == SourceState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        detector.stop();
    }

    #[test]
    fn test_start_stop_idempotent() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir, vec![0.0; RATE as usize]);

        d.stop();
        d.start().unwrap();
        d.start().unwrap();
        assert!(d.is_running());
        d.stop();
        d.stop();
        assert!(!d.is_running());
        assert_eq!(d.source_state(), SourceState::Stopped);
    }

    #[test]
    fn test_callbacks_fire_on_tone() {
        let dir = TempDir::new().unwrap();
        let mut audio = vec![0.0; RATE as usize];
        audio.extend(tone(1.0));
        audio.extend(vec![0.0; RATE as usize]);
        let d = detector(&dir, audio);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        d.register_trigger_callback(&ClassScope::hotword(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        run_to_end(&d);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(d.dropped_frames(), 0);
        assert!(!d.get_confidence_history(&ClassScope::hotword()).is_empty());
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir, Vec::new());
        let result = d.register_trigger_callback(&ClassScope::new("doorbell"), |_| Ok(()));
        assert!(matches!(result, Err(DetectorError::UnknownScope(_))));
    }

    #[test]
    fn test_stop_from_callback_does_not_deadlock() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir, tone(3.0));

        let weak = Arc::downgrade(&d);
        d.register_trigger_callback(&ClassScope::hotword(), move |_| {
            if let Some(detector) = weak.upgrade() {
                detector.stop();
            }
            Ok(())
        })
        .unwrap();

        d.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while d.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!d.is_running());

        // The stopped loop is joined by the next start
        d.start().unwrap();
        d.stop();
    }

    #[test]
    fn test_failing_callback_is_counted() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir, tone(2.0));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        d.register_trigger_callback(&ClassScope::hotword(), |_| Err("consumer offline".into()))
            .unwrap();
        d.register_trigger_callback(&ClassScope::hotword(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        run_to_end(&d);
        assert_eq!(d.callback_failures(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collection_while_running() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir, vec![0.05; 2 * RATE as usize]);

        d.start_collecting("positive").unwrap();
        run_to_end(&d);
        let saved = d.stop_collecting();

        assert_eq!(saved.len(), 1);
        assert_eq!(d.list_samples("alice", Some("positive")).unwrap().len(), 1);
        assert!(!d.is_collecting());
    }
}
