// Detection module
// Model scoring, trigger decisions and the types they exchange

pub mod classifier;
pub mod model;
pub mod trigger;
pub mod types;

pub use classifier::{ClassifierEngine, LoadedModel, ModelInfo};
pub use model::{LoadError, ModelWeights, ValidationMetrics, BASELINE_VERSION};
pub use trigger::{
    CallbackError, CallbackRegistry, CallbackResult, ConfidenceHistory, TriggerCallback,
    TriggerPhase, TriggerPolicy, TriggerRule,
};
pub use types::{ClassScope, ConfidenceScore, TriggerEvent};
