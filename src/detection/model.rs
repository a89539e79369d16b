// Model weights and validation
// Standardized logistic regression over the fixed feature vector

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::features::{
    FeatureVector, CENTROID_INDEX, FEATURE_DIM, FLATNESS_INDEX, LOUDNESS_INDEX, ZCR_INDEX,
};

/// Version number reserved for the built-in baseline
pub const BASELINE_VERSION: u32 = 0;

/// Baseline: p = sigmoid(12 * (loudness - 0.5))
const BASELINE_LOUDNESS_WEIGHT: f32 = 12.0;
const BASELINE_BIAS: f32 = -6.0;

/// Why a model could not be loaded or installed
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum LoadError {
    #[error("Model file missing: {0}")]
    Missing(String),

    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed model: {0}")]
    Malformed(String),

    #[error("Feature dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Model failed canary check: {0}")]
    CanaryFailed(String),
}

/// Held-out metrics recorded alongside every trained artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub train_loss: f32,
    pub validation_loss: f32,
    pub positive_samples: usize,
    pub negative_samples: usize,
    pub train_vectors: usize,
    pub validation_vectors: usize,
    pub epochs: usize,
}

/// Serialized weights of one model artifact.
/// Inputs are standardized with `mean`/`scale` before the linear layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub feature_dim: usize,
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
    pub coefficients: Vec<f32>,
    pub bias: f32,
}

impl ModelWeights {
    /// Loudness-driven fallback used before any user model exists
    pub fn baseline() -> Self {
        let mut coefficients = vec![0.0; FEATURE_DIM];
        coefficients[LOUDNESS_INDEX] = BASELINE_LOUDNESS_WEIGHT;

        ModelWeights {
            feature_dim: FEATURE_DIM,
            mean: vec![0.0; FEATURE_DIM],
            scale: vec![1.0; FEATURE_DIM],
            coefficients,
            bias: BASELINE_BIAS,
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, LoadError> {
        serde_json::from_slice(data).map_err(|e| LoadError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Structural checks: dimensions, finiteness, positive scale
    pub fn check_shape(&self) -> Result<(), LoadError> {
        if self.feature_dim != FEATURE_DIM {
            return Err(LoadError::DimensionMismatch {
                expected: FEATURE_DIM,
                found: self.feature_dim,
            });
        }

        for (name, values) in [
            ("mean", &self.mean),
            ("scale", &self.scale),
            ("coefficients", &self.coefficients),
        ] {
            if values.len() != FEATURE_DIM {
                return Err(LoadError::DimensionMismatch {
                    expected: FEATURE_DIM,
                    found: values.len(),
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(LoadError::Malformed(format!("non-finite value in {}", name)));
            }
        }

        if self.scale.iter().any(|&s| s <= 0.0) {
            return Err(LoadError::Malformed("scale must be positive".to_string()));
        }
        if !self.bias.is_finite() {
            return Err(LoadError::Malformed("non-finite bias".to_string()));
        }

        Ok(())
    }

    /// Shape checks plus canary evaluation. Every canary must score a finite
    /// probability in [0, 1].
    pub fn validate(&self) -> Result<(), LoadError> {
        self.check_shape()?;

        for (name, input) in canary_inputs() {
            let p = self.probability(&input);
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(LoadError::CanaryFailed(format!(
                    "{} input scored {}",
                    name, p
                )));
            }
        }

        Ok(())
    }

    pub fn logit(&self, features: &[f32]) -> f32 {
        let mut z = self.bias;
        for i in 0..self.feature_dim.min(features.len()) {
            z += self.coefficients[i] * (features[i] - self.mean[i]) / self.scale[i];
        }
        z
    }

    /// Probability in [0, 1]; NaN only if the weights are broken
    pub fn probability(&self, features: &FeatureVector) -> f32 {
        sigmoid(self.logit(features.values()))
    }
}

/// Numerically stable logistic function
pub fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Fixed inputs every candidate model is evaluated against before install
pub fn canary_inputs() -> Vec<(&'static str, FeatureVector)> {
    let silence = FeatureVector::zero();

    // Narrowband tone: energy concentrated in one band, low ZCR and flatness
    let mut tone = vec![0.0; FEATURE_DIM];
    tone[5] = 0.9;
    tone[6] = 0.1;
    tone[LOUDNESS_INDEX] = 0.75;
    tone[ZCR_INDEX] = 0.05;
    tone[CENTROID_INDEX] = 0.06;
    tone[FLATNESS_INDEX] = 0.01;

    let saturated = vec![1.0; FEATURE_DIM];

    let mut canaries = vec![("silence", silence)];
    if let Some(tone) = FeatureVector::from_values(tone) {
        canaries.push(("tone", tone));
    }
    if let Some(saturated) = FeatureVector::from_values(saturated) {
        canaries.push(("saturated", saturated));
    }
    canaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_loudness(loudness: f32) -> FeatureVector {
        let mut values = vec![0.0; FEATURE_DIM];
        values[LOUDNESS_INDEX] = loudness;
        FeatureVector::from_values(values).unwrap()
    }

    #[test]
    fn test_baseline_tracks_loudness() {
        let baseline = ModelWeights::baseline();

        assert!(baseline.probability(&FeatureVector::zero()) < 0.01);
        assert!((baseline.probability(&with_loudness(0.5)) - 0.5).abs() < 1e-6);
        assert!(baseline.probability(&with_loudness(0.9)) > 0.95);
    }

    #[test]
    fn test_baseline_passes_validation() {
        assert!(ModelWeights::baseline().validate().is_ok());
        assert_eq!(canary_inputs().len(), 3);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let mut weights = ModelWeights::baseline();
        weights.coefficients.pop();

        assert!(matches!(
            weights.validate(),
            Err(LoadError::DimensionMismatch { expected: FEATURE_DIM, .. })
        ));

        let mut weights = ModelWeights::baseline();
        weights.feature_dim = 13;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_non_finite_weights_rejected() {
        let mut weights = ModelWeights::baseline();
        weights.coefficients[3] = f32::NAN;
        assert!(matches!(weights.validate(), Err(LoadError::Malformed(_))));

        let mut weights = ModelWeights::baseline();
        weights.scale[0] = 0.0;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_canary_catches_overflowing_model() {
        // Opposing infinite contributions produce NaN on the saturated canary
        let mut weights = ModelWeights::baseline();
        weights.coefficients[0] = f32::MAX;
        weights.coefficients[1] = -f32::MAX;
        weights.scale[0] = 1e-30;
        weights.scale[1] = 1e-30;

        assert!(matches!(weights.validate(), Err(LoadError::CanaryFailed(_))));
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(-1000.0).is_finite());
        assert!(sigmoid(1000.0) <= 1.0);
        assert!(sigmoid(-1000.0) >= 0.0);
    }

    #[test]
    fn test_json_round_trip_preserves_weights() {
        let weights = ModelWeights::baseline();
        let bytes = weights.to_json().unwrap();
        assert_eq!(ModelWeights::from_json(&bytes).unwrap(), weights);
        assert!(ModelWeights::from_json(b"{not json").is_err());
    }
}
