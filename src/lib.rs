// Aura Detect - Continuous hotword and sound-event detection
// Module declarations

pub mod audio;
pub mod config;
pub mod detection;
pub mod pipeline;
pub mod state;
pub mod training;

pub use audio::{AudioSource, FrameSource, SourceState, SyntheticSource};
pub use config::{ClassScopeConfig, ConfigError, DetectorConfig};
pub use detection::{ClassScope, ConfidenceScore, ModelInfo, TriggerEvent, TriggerRule};
pub use pipeline::{Detector, DetectorError, DetectorResult};
pub use state::{ModelRegistry, Store};
pub use training::{TrainingError, TrainingJob, TrainingOutcome, TrainingParams};
