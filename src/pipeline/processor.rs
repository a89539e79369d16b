// Frame processing
// Frame -> windows -> features -> scores -> trigger decisions, plus the collector tap

use std::sync::Arc;

use crate::audio::features::FeatureExtractor;
use crate::audio::frame::Frame;
use crate::audio::window::{FrameAggregator, WindowConfig};
use crate::config::DetectorConfig;
use crate::detection::classifier::ClassifierEngine;
use crate::detection::trigger::TriggerPolicy;
use crate::detection::types::{ClassScope, ConfidenceScore, TriggerEvent};
use crate::training::collector::SampleCollector;

/// Scopes sharing one window geometry share one aggregator
struct WindowGroup {
    aggregator: FrameAggregator,
    scopes: Vec<ClassScope>,
}

/// Owns every piece of per-stream state. Runs on the processing thread only;
/// trigger events are returned rather than dispatched so callbacks run
/// without the processor locked.
pub struct FrameProcessor {
    extractor: FeatureExtractor,
    engine: Arc<ClassifierEngine>,
    groups: Vec<WindowGroup>,
    policy: TriggerPolicy,
    collector: SampleCollector,
    windows_processed: u64,
}

impl FrameProcessor {
    pub fn new(
        config: &DetectorConfig,
        extractor: FeatureExtractor,
        engine: Arc<ClassifierEngine>,
        collector: SampleCollector,
    ) -> Self {
        let mut groups: Vec<WindowGroup> = Vec::new();
        for (scope, scope_config) in &config.class_scopes {
            let geometry = scope_config.window_config();
            match groups.iter_mut().find(|g| g.aggregator.config() == geometry) {
                Some(group) => group.scopes.push(scope.clone()),
                None => groups.push(WindowGroup {
                    aggregator: FrameAggregator::new(geometry),
                    scopes: vec![scope.clone()],
                }),
            }
        }

        FrameProcessor {
            extractor,
            engine,
            groups,
            policy: TriggerPolicy::new(config.trigger_rules()),
            collector,
            windows_processed: 0,
        }
    }

    /// Feed one frame. Returns the trigger events it caused, in stream order.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<TriggerEvent> {
        self.collector.observe(frame);

        let mut events = Vec::new();
        for group in &mut self.groups {
            for window in group.aggregator.push(frame) {
                let features = self.extractor.extract(&window);
                let scores = self
                    .engine
                    .predict_scopes(&features, &group.scopes, window.end());
                self.windows_processed += 1;

                events.extend(scores.iter().filter_map(|score| self.policy.observe(score)));
            }
        }

        if self.groups.len() > 1 {
            events.sort_by(|a, b| a.stream_time.total_cmp(&b.stream_time));
        }
        events
    }

    /// End of stream: drop partial windows. Returns the samples discarded.
    pub fn finish(&mut self) -> usize {
        let discarded: usize = self.groups.iter_mut().map(|g| g.aggregator.finish()).sum();
        if discarded > 0 {
            log::debug!("Discarded {} samples of partial windows", discarded);
        }
        discarded
    }

    /// Prepare for a new stream whose time starts again at zero
    pub fn reset_stream(&mut self) {
        self.finish();
        self.policy.reset_timing();
    }

    pub fn history(&self, class_scope: &ClassScope) -> Vec<ConfidenceScore> {
        self.policy.history(class_scope)
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    pub fn collector(&self) -> &SampleCollector {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut SampleCollector {
        &mut self.collector
    }

    pub fn windows_processed(&self) -> u64 {
        self.windows_processed
    }

    /// Window geometries in use, one per aggregator
    pub fn window_configs(&self) -> Vec<WindowConfig> {
        self.groups.iter().map(|g| g.aggregator.config()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassScopeConfig;
    use crate::state::store::Store;
    use crate::training::collector::CollectionConfig;
    use tempfile::TempDir;

    const RATE: u32 = 16000;

    fn processor(dir: &TempDir, config: &DetectorConfig) -> FrameProcessor {
        let store = Store::open(dir.path()).unwrap();
        let engine = Arc::new(ClassifierEngine::with_baselines(&config.owner, &config.scopes()));
        let collector = SampleCollector::new(store, &config.owner, CollectionConfig::default());
        FrameProcessor::new(config, FeatureExtractor::new(), engine, collector)
    }

    fn tone(seconds: f64, amplitude: f32) -> Vec<f32> {
        let n = (seconds * RATE as f64) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
            .collect()
    }

    fn run(p: &mut FrameProcessor, audio: &[f32]) -> Vec<TriggerEvent> {
        audio
            .chunks(1024)
            .enumerate()
            .flat_map(|(i, chunk)| {
                let frame = Frame::new(chunk.to_vec(), RATE, (i * 1024) as f64 / RATE as f64);
                p.process_frame(&frame)
            })
            .collect()
    }

    #[test]
    fn test_loud_tone_fires_once() {
        let dir = TempDir::new().unwrap();
        let config = DetectorConfig::default();
        let mut p = processor(&dir, &config);

        let mut audio = vec![0.0; RATE as usize];
        audio.extend(tone(1.0, 0.5));
        audio.extend(vec![0.0; 2 * RATE as usize]);

        let events = run(&mut p, &audio);
        assert_eq!(events.len(), 1);
        assert!(events[0].stream_time > 1.0 && events[0].stream_time <= 2.0);
        assert!(p.windows_processed() > 0);
    }

    #[test]
    fn test_silence_never_fires() {
        let dir = TempDir::new().unwrap();
        let config = DetectorConfig::default();
        let mut p = processor(&dir, &config);

        let events = run(&mut p, &vec![0.0; 5 * RATE as usize]);
        assert!(events.is_empty());

        let history = p.history(&ClassScope::hotword());
        assert!(!history.is_empty());
        assert!(history.iter().all(|s| s.probability < 0.5));
    }

    #[test]
    fn test_scopes_group_by_window_geometry() {
        let dir = TempDir::new().unwrap();
        let mut config = DetectorConfig::default();
        config
            .class_scopes
            .insert(ClassScope::new("glass"), ClassScopeConfig::default());
        config.class_scopes.insert(
            ClassScope::new("siren"),
            ClassScopeConfig {
                window_duration: 2.0,
                ..Default::default()
            },
        );

        let p = processor(&dir, &config);
        assert_eq!(
            p.window_configs(),
            vec![WindowConfig::new(1.0, 0.25), WindowConfig::new(2.0, 0.5)]
        );
    }

    #[test]
    fn test_reset_stream_clears_cooldown() {
        let dir = TempDir::new().unwrap();
        let config = DetectorConfig::default();
        let mut p = processor(&dir, &config);

        assert_eq!(run(&mut p, &tone(1.5, 0.5)).len(), 1);
        p.reset_stream();
        // Same stream times again; without the reset the cooldown would hold
        assert_eq!(run(&mut p, &tone(1.5, 0.5)).len(), 1);
    }
}
