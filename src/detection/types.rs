// Detection types
// Class scopes, confidence scores and trigger events shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of a detection target, e.g. `hotword` or `doorbell`.
/// Each scope has its own model, trigger rule and history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassScope(String);

impl ClassScope {
    pub fn new(name: impl Into<String>) -> Self {
        ClassScope(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The conventional wake-word scope
    pub fn hotword() -> Self {
        ClassScope::new("hotword")
    }
}

impl fmt::Display for ClassScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassScope {
    fn from(name: &str) -> Self {
        ClassScope::new(name)
    }
}

impl From<String> for ClassScope {
    fn from(name: String) -> Self {
        ClassScope(name)
    }
}

/// One model output for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub class_scope: ClassScope,

    /// Probability in [0, 1]
    pub probability: f32,

    /// Stream time (seconds) of the end of the scored window
    pub timestamp: f64,

    /// Version of the model that produced the score; 0 is the baseline
    pub model_version: u32,
}

/// A discrete detection handed to registered callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub class_scope: ClassScope,

    /// Score of the window that completed the debounce run
    pub confidence: f32,

    /// Stream time (seconds) at which the trigger fired
    pub stream_time: f64,

    /// Wall-clock time of firing
    pub fired_at: DateTime<Utc>,

    pub model_version: u32,
}

impl TriggerEvent {
    pub fn from_score(score: &ConfidenceScore) -> Self {
        TriggerEvent {
            id: Uuid::new_v4(),
            class_scope: score.class_scope.clone(),
            confidence: score.probability,
            stream_time: score.timestamp,
            fired_at: Utc::now(),
            model_version: score.model_version,
        }
    }
}
