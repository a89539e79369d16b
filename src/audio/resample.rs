// Sample-rate conversion to the model rate
// Whole-buffer conversion with rubato, compensating for the resampler delay

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

const RESAMPLER_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Invalid sample rate: {0} Hz")]
    InvalidRate(u32),

    #[error("Failed to create resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("Resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// Resample mono audio from `from_rate` to `to_rate`.
/// The output has `len * to_rate / from_rate` samples, aligned with the input.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, ResampleError> {
    if from_rate == 0 {
        return Err(ResampleError::InvalidRate(from_rate));
    }
    if to_rate == 0 {
        return Err(ResampleError::InvalidRate(to_rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLER_CHUNK_SIZE,
        1,
        1,
    )?;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + RESAMPLER_CHUNK_SIZE);
    let mut chunk = vec![0.0f32; RESAMPLER_CHUNK_SIZE];

    for block in samples.chunks(RESAMPLER_CHUNK_SIZE) {
        chunk[..block.len()].copy_from_slice(block);
        chunk[block.len()..].fill(0.0);
        let out = resampler.process(&[&chunk[..]], None)?;
        output.extend_from_slice(&out[0]);
    }

    // Push silence through until the delayed tail has come out
    chunk.fill(0.0);
    while output.len() < expected + delay {
        let out = resampler.process(&[&chunk[..]], None)?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Linear-interpolation fallback when the FFT resampler is unavailable
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 || samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }

    let expected = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..expected)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}
