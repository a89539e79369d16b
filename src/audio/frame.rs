// Frame and window types
// Frames come off the capture path, windows are what feature extraction sees

/// A fixed-size block of mono samples from the capture path
#[derive(Debug, Clone)]
pub struct Frame {
    /// Mono samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Stream time of the first sample, in seconds since capture start.
    /// Derived from produced sample counts, so dropped frames leave a gap.
    pub timestamp: f64,
}

impl Frame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: f64) -> Self {
        Frame {
            samples,
            sample_rate,
            timestamp,
        }
    }

    /// Duration of this frame in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Stream time just past the last sample
    pub fn end_time(&self) -> f64 {
        self.timestamp + self.duration_secs()
    }
}

/// Contiguous audio spanning one analysis window
#[derive(Debug, Clone)]
pub struct Window {
    /// Mono samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Stream time of the first sample in seconds
    pub start: f64,
}

impl Window {
    pub fn new(samples: Vec<f32>, sample_rate: u32, start: f64) -> Self {
        Window {
            samples,
            sample_rate,
            start,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Stream time just past the last sample; scores are stamped with this
    pub fn end(&self) -> f64 {
        self.start + self.duration_secs()
    }
}

/// Number of samples covering `seconds` at `sample_rate`
pub fn samples_for(seconds: f64, sample_rate: u32) -> usize {
    (seconds * sample_rate as f64).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_timing() {
        let frame = Frame::new(vec![0.0; 1600], 16000, 2.0);
        assert!((frame.duration_secs() - 0.1).abs() < 1e-9);
        assert!((frame.end_time() - 2.1).abs() < 1e-9);
    }

    #[test]
    fn test_window_end() {
        let window = Window::new(vec![0.0; 16000], 16000, 4.5);
        assert!((window.end() - 5.5).abs() < 1e-9);
        assert_eq!(window.len(), 16000);
    }

    #[test]
    fn test_samples_for() {
        assert_eq!(samples_for(1.0, 16000), 16000);
        assert_eq!(samples_for(0.25, 16000), 4000);
        assert_eq!(samples_for(-1.0, 16000), 0);
    }
}
