// Classifier engine
// Holds the active model per class scope behind atomically swappable references

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::audio::features::FeatureVector;
use crate::detection::model::{LoadError, ModelWeights, ValidationMetrics, BASELINE_VERSION};
use crate::detection::types::{ClassScope, ConfidenceScore};

/// A validated model ready to serve
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub owner: String,
    pub class_scope: ClassScope,
    pub version: u32,
    pub weights: ModelWeights,
    /// SHA-256 of the artifact file; `None` for the baseline
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metrics: Option<ValidationMetrics>,
}

impl LoadedModel {
    pub fn baseline(owner: &str, class_scope: ClassScope) -> Self {
        LoadedModel {
            owner: owner.to_string(),
            class_scope,
            version: BASELINE_VERSION,
            weights: ModelWeights::baseline(),
            checksum: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            metrics: None,
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.version == BASELINE_VERSION
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            owner: self.owner.clone(),
            class_scope: self.class_scope.clone(),
            version: self.version,
            is_baseline: self.is_baseline(),
            checksum: self.checksum.clone(),
            created_at: self.created_at,
            metrics: self.metrics.clone(),
        }
    }
}

/// What is serving a class scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub owner: String,
    pub class_scope: ClassScope,
    pub version: u32,
    pub is_baseline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ValidationMetrics>,
}

/// Scores feature vectors against the active model of each class scope.
///
/// Readers clone the `Arc` references under a short read lock, so a swap
/// never blocks or tears an in-flight prediction: it finishes against the
/// model it started with. Only the registry installs models.
#[derive(Debug, Default)]
pub struct ClassifierEngine {
    models: RwLock<BTreeMap<ClassScope, Arc<LoadedModel>>>,
}

impl ClassifierEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine serving the baseline for every given scope
    pub fn with_baselines(owner: &str, scopes: &[ClassScope]) -> Self {
        let models = scopes
            .iter()
            .map(|scope| {
                (
                    scope.clone(),
                    Arc::new(LoadedModel::baseline(owner, scope.clone())),
                )
            })
            .collect();

        ClassifierEngine {
            models: RwLock::new(models),
        }
    }

    /// Validate a candidate without installing it
    pub fn validate(&self, weights: &ModelWeights) -> Result<(), LoadError> {
        weights.validate()
    }

    /// Swap in a new model for its scope. On failure the previous model
    /// keeps serving.
    pub(crate) fn install(&self, model: LoadedModel) -> Result<Arc<LoadedModel>, LoadError> {
        self.validate(&model.weights)?;

        let model = Arc::new(model);
        let previous = {
            let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
            models.insert(model.class_scope.clone(), Arc::clone(&model))
        };

        log::info!(
            "Installed model for {} (owner {}): version {} -> {}",
            model.class_scope,
            model.owner,
            previous.map_or_else(|| "none".to_string(), |m| m.version.to_string()),
            model.version
        );
        Ok(model)
    }

    /// Point-in-time view of every installed model
    pub fn snapshot(&self) -> BTreeMap<ClassScope, Arc<LoadedModel>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active(&self, class_scope: &ClassScope) -> Option<Arc<LoadedModel>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(class_scope)
            .cloned()
    }

    pub fn active_info(&self, class_scope: &ClassScope) -> Option<ModelInfo> {
        self.active(class_scope).map(|m| m.info())
    }

    pub fn scopes(&self) -> Vec<ClassScope> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Score against every installed scope, ordered by scope name
    pub fn predict(&self, features: &FeatureVector, timestamp: f64) -> Vec<ConfidenceScore> {
        self.snapshot()
            .values()
            .map(|model| score(model, features, timestamp))
            .collect()
    }

    /// Score against the listed scopes only; unknown scopes are skipped
    pub fn predict_scopes(
        &self,
        features: &FeatureVector,
        scopes: &[ClassScope],
        timestamp: f64,
    ) -> Vec<ConfidenceScore> {
        let models: Vec<Arc<LoadedModel>> = {
            let guard = self.models.read().unwrap_or_else(|e| e.into_inner());
            scopes.iter().filter_map(|s| guard.get(s).cloned()).collect()
        };

        models
            .iter()
            .map(|model| score(model, features, timestamp))
            .collect()
    }
}

fn score(model: &LoadedModel, features: &FeatureVector, timestamp: f64) -> ConfidenceScore {
    let mut probability = model.weights.probability(features);
    if !probability.is_finite() {
        log::warn!(
            "Model {} v{} produced a non-finite score, reporting 0",
            model.class_scope,
            model.version
        );
        probability = 0.0;
    }

    ConfidenceScore {
        class_scope: model.class_scope.clone(),
        probability: probability.clamp(0.0, 1.0),
        timestamp,
        model_version: model.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::{FEATURE_DIM, LOUDNESS_INDEX};
    use std::thread;

    fn loud() -> FeatureVector {
        let mut values = vec![0.0; FEATURE_DIM];
        values[LOUDNESS_INDEX] = 0.9;
        FeatureVector::from_values(values).unwrap()
    }

    fn model(scope: &str, version: u32, bias: f32) -> LoadedModel {
        let mut weights = ModelWeights::baseline();
        weights.coefficients = vec![0.0; FEATURE_DIM];
        weights.bias = bias;
        LoadedModel {
            owner: "alice".to_string(),
            class_scope: ClassScope::new(scope),
            version,
            weights,
            checksum: Some("abc".to_string()),
            created_at: Utc::now(),
            metrics: None,
        }
    }

    #[test]
    fn test_predict_all_scopes_sorted() {
        let engine = ClassifierEngine::with_baselines(
            "alice",
            &[ClassScope::new("siren"), ClassScope::new("doorbell")],
        );

        let scores = engine.predict(&loud(), 2.0);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].class_scope.as_str(), "doorbell");
        assert_eq!(scores[1].class_scope.as_str(), "siren");
        assert!(scores.iter().all(|s| s.model_version == 0 && s.timestamp == 2.0));
        assert!(scores[0].probability > 0.9);
    }

    #[test]
    fn test_predict_subset() {
        let engine = ClassifierEngine::with_baselines(
            "alice",
            &[ClassScope::new("siren"), ClassScope::new("doorbell")],
        );

        let scores = engine.predict_scopes(
            &FeatureVector::zero(),
            &[ClassScope::new("siren"), ClassScope::new("unknown")],
            0.0,
        );
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].class_scope.as_str(), "siren");
    }

    #[test]
    fn test_install_replaces_model() {
        let engine = ClassifierEngine::with_baselines("alice", &[ClassScope::hotword()]);
        engine.install(model("hotword", 4, 2.0)).unwrap();

        let info = engine.active_info(&ClassScope::hotword()).unwrap();
        assert_eq!(info.version, 4);
        assert!(!info.is_baseline);

        let scores = engine.predict(&FeatureVector::zero(), 0.0);
        assert_eq!(scores[0].model_version, 4);
        assert!((scores[0].probability - sigmoid_of(2.0)).abs() < 1e-6);
    }

    fn sigmoid_of(z: f32) -> f32 {
        crate::detection::model::sigmoid(z)
    }

    #[test]
    fn test_invalid_model_keeps_previous() {
        let engine = ClassifierEngine::with_baselines("alice", &[ClassScope::hotword()]);

        let mut broken = model("hotword", 7, 0.0);
        broken.weights.mean.truncate(3);
        assert!(engine.install(broken).is_err());

        assert_eq!(engine.active_info(&ClassScope::hotword()).unwrap().version, 0);
    }

    #[test]
    fn test_swap_never_tears_predictions() {
        let engine = Arc::new(ClassifierEngine::with_baselines("alice", &[ClassScope::hotword()]));

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..2000 {
                    let scores = engine.predict(&FeatureVector::zero(), 0.0);
                    let s = &scores[0];
                    // Version n always has bias n, so the score identifies its model
                    let expected = if s.model_version == 0 {
                        sigmoid_of(-6.0)
                    } else {
                        sigmoid_of(s.model_version as f32)
                    };
                    assert!((s.probability - expected).abs() < 1e-6);
                }
            })
        };

        for version in 1..=50 {
            engine.install(model("hotword", version, version as f32)).unwrap();
        }
        reader.join().unwrap();
    }
}
