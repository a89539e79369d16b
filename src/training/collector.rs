// Sample collection
// Taps the live frame stream and persists labeled segments for training

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::frame::{samples_for, Frame};
use crate::state::models::{SampleMetadata, SampleRecord};
use crate::state::storage::sanitize_component;
use crate::state::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Invalid collection label: {0:?}")]
    InvalidLabel(String),

    #[error("Failed to persist sample: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Length of each persisted sample in seconds
    pub sample_duration: f64,

    /// Shorter trailing segments are dropped instead of persisted
    pub min_sample_duration: f64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            sample_duration: 3.0,
            min_sample_duration: 0.1,
        }
    }
}

struct Segment {
    label: String,
    buffer: Vec<f32>,
    sample_rate: u32,
    /// Stream time of the first buffered sample
    start: f64,
    expected_next: f64,
}

impl Segment {
    fn duration(&self) -> f64 {
        self.buffer.len() as f64 / self.sample_rate as f64
    }
}

/// Persists audio while collection is active. Detection output is unaffected:
/// the collector only reads frames.
pub struct SampleCollector {
    store: Store,
    owner: String,
    config: CollectionConfig,
    label: Option<String>,
    segment: Option<Segment>,
    persisted: Vec<SampleRecord>,
    failures: u64,
}

impl SampleCollector {
    pub fn new(store: Store, owner: impl Into<String>, config: CollectionConfig) -> Self {
        SampleCollector {
            store,
            owner: owner.into(),
            config,
            label: None,
            segment: None,
            persisted: Vec::new(),
            failures: 0,
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.label.is_some()
    }

    /// Segments that failed to persist
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Begin collecting under `label`. Switching labels flushes the current
    /// segment under the old label first; the same label is a no-op.
    pub fn start_collecting(&mut self, label: &str) -> Result<(), CollectorError> {
        let label = label.trim();
        if sanitize_component(label).is_err() {
            return Err(CollectorError::InvalidLabel(label.to_string()));
        }

        if self.label.as_deref() == Some(label) {
            return Ok(());
        }
        if self.label.is_some() {
            self.flush();
        }

        log::info!("Collecting samples for {} as {:?}", self.owner, label);
        self.label = Some(label.to_string());
        Ok(())
    }

    /// Stop collecting, persisting the partial segment. Returns every sample
    /// persisted since the last drain. Idempotent.
    pub fn stop_collecting(&mut self) -> Vec<SampleRecord> {
        if let Some(label) = self.label.take() {
            self.flush();
            log::info!("Stopped collecting {:?}", label);
        }
        self.take_persisted()
    }

    /// Samples persisted since the last call
    pub fn take_persisted(&mut self) -> Vec<SampleRecord> {
        std::mem::take(&mut self.persisted)
    }

    /// Feed one frame from the live stream
    pub fn observe(&mut self, frame: &Frame) {
        let Some(label) = self.label.clone() else {
            return;
        };
        if frame.samples.is_empty() || frame.sample_rate == 0 {
            return;
        }

        let discontinuous = self.segment.as_ref().is_some_and(|s| {
            s.sample_rate != frame.sample_rate
                || (frame.timestamp - s.expected_next).abs() > 0.5 / frame.sample_rate as f64 + 1e-9
        });
        if discontinuous {
            self.flush();
        }

        let segment = self.segment.get_or_insert_with(|| Segment {
            label,
            buffer: Vec::new(),
            sample_rate: frame.sample_rate,
            start: frame.timestamp,
            expected_next: frame.timestamp,
        });
        segment.buffer.extend_from_slice(&frame.samples);
        segment.expected_next = frame.end_time();

        let segment_len = samples_for(self.config.sample_duration, frame.sample_rate).max(1);
        while self
            .segment
            .as_ref()
            .is_some_and(|s| s.buffer.len() >= segment_len)
        {
            self.emit_full_segment(segment_len);
        }
    }

    fn emit_full_segment(&mut self, segment_len: usize) {
        let Some(segment) = self.segment.as_mut() else {
            return;
        };

        let audio: Vec<f32> = segment.buffer.drain(..segment_len).collect();
        let start = segment.start;
        let rate = segment.sample_rate;
        let label = segment.label.clone();
        segment.start += segment_len as f64 / rate as f64;

        self.persist(&label, &audio, rate, start);
    }

    /// Persist whatever is buffered as a short final sample
    fn flush(&mut self) {
        let Some(segment) = self.segment.take() else {
            return;
        };
        if segment.buffer.is_empty() {
            return;
        }

        if segment.duration() < self.config.min_sample_duration {
            log::debug!(
                "Dropping {:.3}s trailing segment (minimum {:.3}s)",
                segment.duration(),
                self.config.min_sample_duration
            );
            return;
        }

        self.persist(&segment.label, &segment.buffer, segment.sample_rate, segment.start);
    }

    fn persist(&mut self, label: &str, audio: &[f32], sample_rate: u32, start: f64) {
        let metadata = SampleMetadata::describe(audio, start, "live");
        match self
            .store
            .save_sample(&self.owner, label, audio, sample_rate, metadata)
        {
            Ok(record) => {
                log::info!(
                    "Collected {:.2}s sample {} for {}/{}",
                    record.duration_secs(),
                    record.id,
                    self.owner,
                    label
                );
                self.persisted.push(record);
            }
            Err(e) => {
                self.failures += 1;
                log::error!("{}", CollectorError::from(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RATE: u32 = 1000;

    fn collector(dir: &TempDir) -> SampleCollector {
        let store = Store::open(dir.path()).unwrap();
        SampleCollector::new(store, "alice", CollectionConfig::default())
    }

    fn feed(collector: &mut SampleCollector, seconds: f64, from: f64) {
        let frames = (seconds * 10.0).round() as usize;
        for i in 0..frames {
            let t = from + i as f64 * 0.1;
            collector.observe(&Frame::new(vec![0.2; 100], RATE, t));
        }
    }

    #[test]
    fn test_inactive_collector_ignores_frames() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);
        feed(&mut c, 5.0, 0.0);
        assert!(c.stop_collecting().is_empty());
    }

    #[test]
    fn test_short_collection_persists_one_sample() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);

        c.start_collecting("positive").unwrap();
        feed(&mut c, 2.0, 0.0);
        let saved = c.stop_collecting();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].label, "positive");
        assert!(saved[0].duration_secs() <= 2.0);
        assert!(c.stop_collecting().is_empty());
    }

    #[test]
    fn test_long_collection_is_segmented() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);

        c.start_collecting("noise").unwrap();
        feed(&mut c, 7.0, 0.0);
        let saved = c.stop_collecting();

        let durations: Vec<f64> = saved.iter().map(|r| r.duration_secs()).collect();
        assert_eq!(durations, vec![3.0, 3.0, 1.0]);
        assert_eq!(saved[1].metadata.stream_time, 3.0);
    }

    #[test]
    fn test_tiny_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);

        c.start_collecting("noise").unwrap();
        c.observe(&Frame::new(vec![0.2; 50], RATE, 0.0));
        assert!(c.stop_collecting().is_empty());
    }

    #[test]
    fn test_label_switch_flushes_old_label() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);

        c.start_collecting("positive").unwrap();
        feed(&mut c, 1.0, 0.0);
        c.start_collecting("negative").unwrap();
        feed(&mut c, 1.0, 1.0);
        let saved = c.stop_collecting();

        let labels: Vec<&str> = saved.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["positive", "negative"]);
    }

    #[test]
    fn test_invalid_label_rejected() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);
        assert!(matches!(
            c.start_collecting("  "),
            Err(CollectorError::InvalidLabel(_))
        ));
        assert!(!c.is_collecting());
    }

    #[test]
    fn test_gap_splits_segment() {
        let dir = TempDir::new().unwrap();
        let mut c = collector(&dir);

        c.start_collecting("positive").unwrap();
        feed(&mut c, 1.0, 0.0);
        feed(&mut c, 1.0, 5.0);
        let saved = c.stop_collecting();

        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].metadata.stream_time, 5.0);
    }
}
