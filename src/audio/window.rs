// Frame aggregation into analysis windows
// Windows have a fixed duration D and advance by a hop H (0 < H <= D)

use crate::audio::frame::{samples_for, Frame, Window};

/// Window geometry for one group of class scopes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Window duration D in seconds
    pub duration: f64,

    /// Hop H in seconds between consecutive window starts
    pub hop: f64,
}

impl WindowConfig {
    pub fn new(duration: f64, hop: f64) -> Self {
        WindowConfig { duration, hop }
    }

    /// Non-overlapping windows
    pub fn contiguous(duration: f64) -> Self {
        WindowConfig::new(duration, duration)
    }

    pub fn is_valid(&self) -> bool {
        self.duration.is_finite()
            && self.hop.is_finite()
            && self.duration > 0.0
            && self.hop > 0.0
            && self.hop <= self.duration
    }
}

/// Accumulates frames and emits windows of exactly D seconds.
/// A partial window at stream stop is discarded, never zero-padded.
pub struct FrameAggregator {
    config: WindowConfig,
    sample_rate: Option<u32>,
    window_samples: usize,
    hop_samples: usize,
    buffer: Vec<f32>,
    /// Stream time of the current contiguous segment's first sample
    segment_origin: f64,
    /// Index (within the segment) of the first buffered sample
    buffer_offset: u64,
    /// Expected timestamp of the next frame
    expected_next: Option<f64>,
}

impl FrameAggregator {
    pub fn new(config: WindowConfig) -> Self {
        FrameAggregator {
            config,
            sample_rate: None,
            window_samples: 0,
            hop_samples: 0,
            buffer: Vec::new(),
            segment_origin: 0.0,
            buffer_offset: 0,
            expected_next: None,
        }
    }

    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Samples currently buffered toward the next window
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Add a frame, returning every window it completes
    pub fn push(&mut self, frame: &Frame) -> Vec<Window> {
        if frame.samples.is_empty() || frame.sample_rate == 0 {
            return Vec::new();
        }

        if self.needs_reset(frame) {
            let discarded = self.buffer.len();
            if discarded > 0 {
                log::debug!(
                    "Stream discontinuity at {:.3}s, discarding {} buffered samples",
                    frame.timestamp,
                    discarded
                );
            }
            self.begin_segment(frame);
        }

        self.buffer.extend_from_slice(&frame.samples);
        self.expected_next = Some(frame.end_time());

        let mut windows = Vec::new();
        let rate = frame.sample_rate;

        while self.window_samples > 0 && self.buffer.len() >= self.window_samples {
            let start = self.segment_origin + self.buffer_offset as f64 / rate as f64;
            windows.push(Window::new(
                self.buffer[..self.window_samples].to_vec(),
                rate,
                start,
            ));

            self.buffer.drain(..self.hop_samples);
            self.buffer_offset += self.hop_samples as u64;
        }

        windows
    }

    /// End of stream: drop the partial window. Returns the samples discarded.
    pub fn finish(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.sample_rate = None;
        self.expected_next = None;
        self.buffer_offset = 0;
        discarded
    }

    fn needs_reset(&self, frame: &Frame) -> bool {
        if self.sample_rate != Some(frame.sample_rate) {
            return true;
        }

        match self.expected_next {
            Some(expected) => {
                let tolerance = 0.5 / frame.sample_rate as f64 + 1e-9;
                (frame.timestamp - expected).abs() > tolerance
            }
            None => true,
        }
    }

    fn begin_segment(&mut self, frame: &Frame) {
        let rate = frame.sample_rate;
        self.sample_rate = Some(rate);
        self.window_samples = samples_for(self.config.duration, rate).max(1);
        self.hop_samples = samples_for(self.config.hop, rate).clamp(1, self.window_samples);
        self.buffer.clear();
        self.segment_origin = frame.timestamp;
        self.buffer_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 1000;

    fn frames(count: usize, size: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| {
                let samples = (0..size).map(|j| (i * size + j) as f32).collect();
                Frame::new(samples, RATE, (i * size) as f64 / RATE as f64)
            })
            .collect()
    }

    #[test]
    fn test_windows_have_exact_length() {
        let mut agg = FrameAggregator::new(WindowConfig::contiguous(1.0));
        let mut windows = Vec::new();
        for frame in frames(35, 100) {
            windows.extend(agg.push(&frame));
        }

        assert_eq!(windows.len(), 3);
        for window in &windows {
            assert_eq!(window.len(), 1000);
        }

        // 500 samples left over are discarded, not padded
        assert_eq!(agg.finish(), 500);
    }

    #[test]
    fn test_window_lengths_for_odd_frame_sizes() {
        for frame_size in [1, 7, 33, 128, 999, 1000, 1500] {
            let mut agg = FrameAggregator::new(WindowConfig::new(1.0, 0.3));
            for frame in frames(20, frame_size) {
                for window in agg.push(&frame) {
                    assert_eq!(window.len(), 1000, "frame size {}", frame_size);
                }
            }
        }
    }

    #[test]
    fn test_overlapping_hop() {
        let mut agg = FrameAggregator::new(WindowConfig::new(1.0, 0.25));
        let mut windows = Vec::new();
        for frame in frames(20, 100) {
            windows.extend(agg.push(&frame));
        }

        // 2000 samples, window 1000, hop 250 -> starts at 0, 250, ..., 1000
        assert_eq!(windows.len(), 5);
        assert!((windows[1].start - 0.25).abs() < 1e-9);
        assert!((windows[4].end() - 2.0).abs() < 1e-9);
        // Samples are consumed in arrival order
        assert_eq!(windows[1].samples[0], 250.0);
    }

    #[test]
    fn test_gap_resets_partial_window() {
        let mut agg = FrameAggregator::new(WindowConfig::contiguous(1.0));
        assert!(agg.push(&Frame::new(vec![0.1; 600], RATE, 0.0)).is_empty());

        // Frame arrives after a 0.4s gap (dropped frames)
        let windows = agg.push(&Frame::new(vec![0.2; 600], RATE, 1.0));
        assert!(windows.is_empty());
        assert_eq!(agg.buffered(), 600);

        let windows = agg.push(&Frame::new(vec![0.2; 400], RATE, 1.6));
        assert_eq!(windows.len(), 1);
        assert!((windows[0].start - 1.0).abs() < 1e-9);
        assert!(windows[0].samples.iter().all(|&s| s == 0.2));
    }

    #[test]
    fn test_config_validation() {
        assert!(WindowConfig::new(1.0, 0.5).is_valid());
        assert!(WindowConfig::contiguous(0.5).is_valid());
        assert!(!WindowConfig::new(1.0, 1.5).is_valid());
        assert!(!WindowConfig::new(0.0, 0.0).is_valid());
        assert!(!WindowConfig::new(1.0, f64::NAN).is_valid());
    }
}
