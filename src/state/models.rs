// Persisted records for samples and model artifacts
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::model::ValidationMetrics;
use crate::detection::types::ClassScope;

/// Label that marks a sample as a positive example for any scope
pub const POSITIVE_LABEL: &str = "positive";

/// Where and how a sample was captured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    /// Stream time (seconds) of the first sample
    pub stream_time: f64,

    /// Peak absolute amplitude
    pub peak: f32,

    /// RMS level
    pub rms: f32,

    /// `live` for collector output, `import` for files added by hand
    pub source: String,
}

impl SampleMetadata {
    pub fn describe(samples: &[f32], stream_time: f64, source: &str) -> Self {
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let rms = if samples.is_empty() {
            0.0
        } else {
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
        };

        SampleMetadata {
            stream_time,
            peak,
            rms,
            source: source.to_string(),
        }
    }
}

/// Index row for a persisted sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: Uuid,
    pub owner: String,
    pub label: String,
    pub path: String,
    pub sha256: String,
    pub sample_rate: u32,
    pub num_samples: u64,
    pub created_at: DateTime<Utc>,
    pub metadata: SampleMetadata,
}

impl SampleRecord {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.num_samples as f64 / self.sample_rate as f64
    }
}

/// A labeled raw recording used for training
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: Uuid,
    pub owner: String,
    pub label: String,
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    pub timestamp: DateTime<Utc>,
    pub metadata: SampleMetadata,
}

impl Sample {
    /// An in-memory sample that has not been persisted
    pub fn new(owner: &str, label: &str, audio: Vec<f32>, sample_rate: u32) -> Self {
        let metadata = SampleMetadata::describe(&audio, 0.0, "memory");
        Sample {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            label: label.to_string(),
            audio,
            sample_rate,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Positive for `class_scope` when labeled `positive` or with the scope name
    pub fn is_positive_for(&self, class_scope: &ClassScope) -> bool {
        self.label == POSITIVE_LABEL || self.label == class_scope.as_str()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.audio.len() as f64 / self.sample_rate as f64
    }
}

/// Index row for a published model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: Uuid,
    pub owner: String,
    pub class_scope: ClassScope,
    pub version: u32,
    pub path: String,
    pub metrics_path: Option<String>,
    pub sha256: String,
    pub bytes: i64,
    pub created_at: DateTime<Utc>,
    pub metrics: ValidationMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModelRecord {
    pub owner: String,
    pub class_scope: ClassScope,
    pub version: u32,
    pub activated_at: DateTime<Utc>,
}
