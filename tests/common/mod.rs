// Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use aura_detect::audio::{FeatureExtractor, Frame};
use aura_detect::detection::ClassifierEngine;
use aura_detect::pipeline::FrameProcessor;
use aura_detect::state::SampleMetadata;
use aura_detect::training::SampleCollector;
use aura_detect::{Detector, DetectorConfig, SourceState, Store, SyntheticSource, TriggerEvent};

pub const RATE: u32 = 16000;
pub const FRAME_SIZE: usize = 1024;
pub const OWNER: &str = "alice";

/// Sine tone
pub fn sine(frequency: f32, seconds: f64, amplitude: f32) -> Vec<f32> {
    let n = (seconds * RATE as f64) as usize;
    (0..n)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * frequency * i as f32 / RATE as f32).sin())
        .collect()
}

pub fn silence(seconds: f64) -> Vec<f32> {
    vec![0.0; (seconds * RATE as f64) as usize]
}

/// Low-level white noise
pub fn noise(seconds: f64, amplitude: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..(seconds * RATE as f64) as usize)
        .map(|_| rng.gen_range(-amplitude..amplitude))
        .collect()
}

/// 10 s of silence with a 0.5 amplitude tone from 5 s to 6 s
pub fn scenario_audio() -> Vec<f32> {
    let mut audio = silence(5.0);
    audio.extend(sine(440.0, 1.0, 0.5));
    audio.extend(silence(4.0));
    audio
}

/// Defaults with a queue large enough for unpaced synthetic playback
pub fn test_config() -> DetectorConfig {
    let mut config = DetectorConfig::default();
    config.owner = OWNER.to_string();
    config.audio.queue_capacity = 4096;
    config
}

pub fn open_detector(dir: &TempDir, config: DetectorConfig, audio: Vec<f32>) -> Arc<Detector> {
    let store = Store::open(dir.path()).expect("failed to open store");
    let source = SyntheticSource::new(audio, RATE, FRAME_SIZE);
    Arc::new(Detector::with_store(config, store, Box::new(source)).expect("failed to build detector"))
}

/// Start, let the source play out, stop
pub fn run_to_end(detector: &Detector) {
    detector.start().expect("failed to start detector");
    let deadline = Instant::now() + Duration::from_secs(30);
    while detector.source_state() == SourceState::Running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    detector.stop();
}

/// A processor wired the way the detector wires it, for synchronous runs
pub fn offline_processor(dir: &TempDir, config: &DetectorConfig) -> FrameProcessor {
    let store = Store::open(dir.path()).expect("failed to open store");
    let engine = Arc::new(ClassifierEngine::with_baselines(&config.owner, &config.scopes()));
    let collector = SampleCollector::new(store, &config.owner, config.collection.clone());
    FrameProcessor::new(config, FeatureExtractor::new(), engine, collector)
}

pub fn feed(processor: &mut FrameProcessor, audio: &[f32]) -> Vec<TriggerEvent> {
    audio
        .chunks(FRAME_SIZE)
        .enumerate()
        .flat_map(|(i, chunk)| {
            let timestamp = (i * FRAME_SIZE) as f64 / RATE as f64;
            processor.process_frame(&Frame::new(chunk.to_vec(), RATE, timestamp))
        })
        .collect()
}

/// Persist `count` samples of `audio` under `label`
pub fn save_samples(store: &Store, label: &str, count: usize, audio: impl Fn(usize) -> Vec<f32>) {
    for i in 0..count {
        let samples = audio(i);
        let metadata = SampleMetadata::describe(&samples, 0.0, "test");
        store
            .save_sample(OWNER, label, &samples, RATE, metadata)
            .expect("failed to save sample");
    }
}
