// Spectral feature extraction
// Turns an analysis window into the fixed-shape vector every model consumes.
// The same extractor runs on the live path and in training.

use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::frame::Window;
use crate::audio::resample::{resample, resample_linear};

/// Rate all features are computed at
pub const MODEL_SAMPLE_RATE: u32 = 16_000;

/// Log-spaced spectral bands
pub const NUM_BANDS: usize = 16;

/// Bands + loudness + ZCR + centroid + flatness
pub const FEATURE_DIM: usize = NUM_BANDS + 4;

pub const LOUDNESS_INDEX: usize = NUM_BANDS;
pub const ZCR_INDEX: usize = NUM_BANDS + 1;
pub const CENTROID_INDEX: usize = NUM_BANDS + 2;
pub const FLATNESS_INDEX: usize = NUM_BANDS + 3;

/// Largest per-feature difference tolerated between a native-rate window and
/// the same audio captured at another rate and resampled
pub const RESAMPLE_ERROR_BUDGET: f32 = 0.05;

/// Below this RMS a window is treated as silence
const SILENCE_RMS: f32 = 1e-4;

/// Loudness maps [-80 dBFS, 0 dBFS] onto [0, 1]
const LOUDNESS_FLOOR_DB: f32 = -80.0;

/// Fixed-shape feature representation of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// The all-zero vector silence maps to
    pub fn zero() -> Self {
        FeatureVector {
            values: vec![0.0; FEATURE_DIM],
        }
    }

    /// Build from raw values; `None` unless exactly `FEATURE_DIM` long
    pub fn from_values(values: Vec<f32>) -> Option<Self> {
        (values.len() == FEATURE_DIM).then_some(FeatureVector { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn loudness(&self) -> f32 {
        self.values[LOUDNESS_INDEX]
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Largest absolute per-feature difference
    pub fn max_abs_diff(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

/// Analysis parameters
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// FFT frame size in samples (power of 2)
    pub fft_size: usize,

    /// Hop between FFT frames in samples
    pub hop_size: usize,

    /// Lower edge of the first band in Hz
    pub min_hz: f32,

    /// Upper edge of the last band in Hz
    pub max_hz: f32,

    /// Rate features are computed at; other rates are resampled
    pub sample_rate: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            fft_size: 512,
            hop_size: 256,
            min_hz: 60.0,
            max_hz: 7600.0,
            sample_rate: MODEL_SAMPLE_RATE,
        }
    }
}

/// Deterministic Window -> FeatureVector transform
#[derive(Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    hann: Vec<f32>,
    band_edges: Vec<usize>,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::with_config(FeatureConfig::default())
    }

    pub fn with_config(config: FeatureConfig) -> Self {
        let fft_size = config.fft_size.max(2);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        let mut hann = vec![1.0; fft_size];
        apply_hann_window(&mut hann);

        let band_edges = compute_band_edges(&config, fft_size);

        FeatureExtractor {
            config: FeatureConfig { fft_size, ..config },
            fft,
            hann,
            band_edges,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract features from a window
    pub fn extract(&self, window: &Window) -> FeatureVector {
        self.extract_samples(&window.samples, window.sample_rate)
    }

    /// Extract features from raw mono samples at `sample_rate`
    pub fn extract_samples(&self, samples: &[f32], sample_rate: u32) -> FeatureVector {
        if samples.is_empty() || sample_rate == 0 {
            return FeatureVector::zero();
        }

        let target_rate = self.config.sample_rate;
        let resampled;
        let samples = if sample_rate != target_rate {
            resampled = resample(samples, sample_rate, target_rate).unwrap_or_else(|e| {
                log::warn!("Falling back to linear resampling: {}", e);
                resample_linear(samples, sample_rate, target_rate)
            });
            &resampled[..]
        } else {
            samples
        };

        if samples.is_empty() {
            return FeatureVector::zero();
        }

        let rms = calculate_rms(samples);
        if rms.is_nan() || rms < SILENCE_RMS {
            return FeatureVector::zero();
        }

        let mut values = vec![0.0; FEATURE_DIM];

        let (band_ratios, centroid, flatness) = self.spectral_features(samples);
        values[..NUM_BANDS].copy_from_slice(&band_ratios);

        let rms_db = 20.0 * rms.log10();
        values[LOUDNESS_INDEX] = ((rms_db - LOUDNESS_FLOOR_DB) / -LOUDNESS_FLOOR_DB).clamp(0.0, 1.0);
        values[ZCR_INDEX] = calculate_zcr(samples);
        values[CENTROID_INDEX] = (centroid / (target_rate as f32 / 2.0)).clamp(0.0, 1.0);
        values[FLATNESS_INDEX] = flatness.clamp(0.0, 1.0);

        FeatureVector { values }
    }

    /// Band energy ratios, spectral centroid (Hz) and mean spectral flatness
    fn spectral_features(&self, samples: &[f32]) -> ([f32; NUM_BANDS], f32, f32) {
        let fft_size = self.config.fft_size;
        let hop = self.config.hop_size.max(1);
        let bin_width = self.config.sample_rate as f32 / fft_size as f32;

        let mut band_energy = [0.0f32; NUM_BANDS];
        let mut weighted_freq = 0.0f32;
        let mut total_power = 0.0f32;
        let mut flatness_sum = 0.0f32;
        let mut flatness_frames = 0usize;

        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();

        let mut start = 0;
        loop {
            let end = (start + fft_size).min(samples.len());
            input.fill(0.0);
            for (i, &s) in samples[start..end].iter().enumerate() {
                input[i] = s * self.hann[i];
            }

            if self.fft.process(&mut input, &mut spectrum).is_ok() {
                let power: Vec<f32> = spectrum.iter().map(|c| c.norm_sqr()).collect();

                for (band, edges) in self.band_edges.windows(2).enumerate() {
                    let hi = edges[1].min(power.len());
                    let lo = edges[0].min(hi);
                    band_energy[band] += power[lo..hi].iter().sum::<f32>();
                }

                for (i, &p) in power.iter().enumerate() {
                    weighted_freq += i as f32 * bin_width * p;
                    total_power += p;
                }

                if let Some(flatness) = spectral_flatness(&power[1..]) {
                    flatness_sum += flatness;
                    flatness_frames += 1;
                }
            }

            if start + fft_size >= samples.len() {
                break;
            }
            start += hop;
        }

        let band_total: f32 = band_energy.iter().sum();
        let mut ratios = [0.0f32; NUM_BANDS];
        if band_total > 0.0 {
            for (ratio, energy) in ratios.iter_mut().zip(band_energy.iter()) {
                *ratio = energy / band_total;
            }
        }

        let centroid = if total_power > 0.0 {
            weighted_freq / total_power
        } else {
            0.0
        };

        let flatness = if flatness_frames > 0 {
            flatness_sum / flatness_frames as f32
        } else {
            0.0
        };

        (ratios, centroid, flatness)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Bin indices delimiting the log-spaced bands, strictly increasing
fn compute_band_edges(config: &FeatureConfig, fft_size: usize) -> Vec<usize> {
    let bin_width = config.sample_rate as f32 / fft_size as f32;
    let min_hz = config.min_hz.max(bin_width);
    let max_hz = config.max_hz.max(min_hz * 2.0);
    let ratio = max_hz / min_hz;

    let mut edges = Vec::with_capacity(NUM_BANDS + 1);
    for i in 0..=NUM_BANDS {
        let freq = min_hz * ratio.powf(i as f32 / NUM_BANDS as f32);
        let mut bin = (freq / bin_width).round() as usize;
        if let Some(&prev) = edges.last() {
            bin = bin.max(prev + 1);
        }
        edges.push(bin);
    }
    edges
}

/// Apply Hann window function to reduce spectral leakage
fn apply_hann_window(samples: &mut [f32]) {
    let n = samples.len();
    if n == 0 {
        return;
    }

    for (i, sample) in samples.iter_mut().enumerate() {
        let window_val = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos());
        *sample *= window_val;
    }
}

fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Zero-crossing rate: sign changes per sample
fn calculate_zcr(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}

/// Geometric over arithmetic mean of the power spectrum
fn spectral_flatness(power: &[f32]) -> Option<f32> {
    if power.is_empty() {
        return None;
    }

    let mean = power.iter().sum::<f32>() / power.len() as f32;
    if mean <= f32::EPSILON {
        return None;
    }

    let log_mean = power.iter().map(|p| (p + 1e-12).ln()).sum::<f32>() / power.len() as f32;
    Some(log_mean.exp() / mean)
}
