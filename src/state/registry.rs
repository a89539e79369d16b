// Model registry
// Versioned per-owner, per-scope artifacts and the single publish point into the classifier

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::ArtifactRecord;
use super::storage::{self, calculate_sha256};
use super::store::{Store, StoreError};
use crate::detection::classifier::{ClassifierEngine, LoadedModel, ModelInfo};
use crate::detection::model::{LoadError, ModelWeights, ValidationMetrics, BASELINE_VERSION};
use crate::detection::types::ClassScope;

/// Load failures kept for inspection
const MAX_RECENT_LOAD_ERRORS: usize = 32;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to load model: {0}")]
    Load(#[from] LoadError),

    #[error("No version {version} for {owner}/{class_scope}")]
    UnknownVersion {
        owner: String,
        class_scope: ClassScope,
        version: u32,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A model that could not be loaded and was skipped in favor of a fallback
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub owner: String,
    pub class_scope: ClassScope,
    pub version: u32,
    pub error: LoadError,
    pub at: DateTime<Utc>,
}

/// Versioned storage and activation of model artifacts.
///
/// Only the serving owner's activations reach the classifier; activations
/// for other owners are recorded and take effect when that owner is served.
pub struct ModelRegistry {
    store: Store,
    engine: Arc<ClassifierEngine>,
    serving_owner: String,
    load_errors: Mutex<VecDeque<LoadFailure>>,
    // Serializes version allocation and activation
    write_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(store: Store, engine: Arc<ClassifierEngine>, serving_owner: impl Into<String>) -> Self {
        ModelRegistry {
            store,
            engine,
            serving_owner: serving_owner.into(),
            load_errors: Mutex::new(VecDeque::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ClassifierEngine> {
        &self.engine
    }

    /// Append a new version. Never overwrites an existing one.
    pub fn publish(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        weights: &ModelWeights,
        metrics: &ValidationMetrics,
    ) -> RegistryResult<ArtifactRecord> {
        weights.validate()?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.store.next_model_version(owner, class_scope)?;
        let record = self
            .store
            .write_artifact(owner, class_scope, version, weights, metrics)?;

        log::info!(
            "Published model {}/{} v{} (accuracy {:.3})",
            owner,
            class_scope,
            version,
            metrics.accuracy
        );
        Ok(record)
    }

    /// Make `version` the active model. Version 0 activates the baseline.
    /// Activating the already-active version is a no-op apart from the reload.
    pub fn activate(&self, owner: &str, class_scope: &ClassScope, version: u32) -> RegistryResult<ModelInfo> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let model = if version == BASELINE_VERSION {
            LoadedModel::baseline(owner, class_scope.clone())
        } else {
            let record = self
                .store
                .get_artifact(owner, class_scope, version)?
                .ok_or_else(|| RegistryError::UnknownVersion {
                    owner: owner.to_string(),
                    class_scope: class_scope.clone(),
                    version,
                })?;
            load_artifact(&record)?
        };

        let info = model.info();
        self.store.set_active_version(owner, class_scope, version)?;

        if owner == self.serving_owner {
            self.engine.install(model)?;
        }

        log::info!("Activated model {}/{} v{}", owner, class_scope, version);
        Ok(info)
    }

    /// The model that should serve (owner, class_scope): the recorded active
    /// version, else the newest loadable version, else the baseline.
    ///
    /// A corrupt active artifact is skipped; the fallback becomes the active
    /// version and the failure is kept in `recent_load_errors`.
    pub fn get_active(&self, owner: &str, class_scope: &ClassScope) -> RegistryResult<Arc<LoadedModel>> {
        let recorded = self.store.active_version(owner, class_scope)?;
        if recorded == Some(BASELINE_VERSION) {
            return Ok(Arc::new(LoadedModel::baseline(owner, class_scope.clone())));
        }

        let versions = self.store.list_artifacts(owner, class_scope)?;
        let candidates = versions
            .iter()
            .filter(|r| recorded.map_or(true, |active| r.version <= active));

        for record in candidates {
            match load_artifact(record) {
                Ok(model) => {
                    if recorded.is_some_and(|active| active != record.version) {
                        log::warn!(
                            "Falling back to {}/{} v{}",
                            owner,
                            class_scope,
                            record.version
                        );
                        self.store.set_active_version(owner, class_scope, record.version)?;
                    }
                    return Ok(Arc::new(model));
                }
                Err(error) => self.record_load_error(owner, class_scope, record.version, error),
            }
        }

        if let Some(active) = recorded {
            log::warn!(
                "No loadable model for {}/{} at or below v{}, falling back to baseline",
                owner,
                class_scope,
                active
            );
            self.store.set_active_version(owner, class_scope, BASELINE_VERSION)?;
        }
        Ok(Arc::new(LoadedModel::baseline(owner, class_scope.clone())))
    }

    /// Load and install the active model of every scope at start-up
    pub fn restore(&self, owner: &str, scopes: &[ClassScope]) -> RegistryResult<Vec<ModelInfo>> {
        let mut restored = Vec::with_capacity(scopes.len());

        for scope in scopes {
            let model = self.get_active(owner, scope)?;
            let info = model.info();

            if owner == self.serving_owner {
                self.engine.install(LoadedModel::clone(&model))?;
            }
            log::info!("Restored {}/{} v{}", owner, scope, info.version);
            restored.push(info);
        }

        Ok(restored)
    }

    /// All published versions, newest first
    pub fn list_versions(&self, owner: &str, class_scope: &ClassScope) -> RegistryResult<Vec<ArtifactRecord>> {
        Ok(self.store.list_artifacts(owner, class_scope)?)
    }

    /// What serves (owner, class_scope) right now, or would serve it if loaded
    pub fn get_active_model_info(&self, owner: &str, class_scope: &ClassScope) -> RegistryResult<ModelInfo> {
        if owner == self.serving_owner {
            if let Some(info) = self.engine.active_info(class_scope) {
                return Ok(info);
            }
        }
        Ok(self.get_active(owner, class_scope)?.info())
    }

    /// Load failures absorbed by fallback, oldest first
    pub fn recent_load_errors(&self) -> Vec<LoadFailure> {
        self.load_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record_load_error(&self, owner: &str, class_scope: &ClassScope, version: u32, error: LoadError) {
        log::error!(
            "Failed to load model {}/{} v{}: {}",
            owner,
            class_scope,
            version,
            error
        );

        let mut errors = self.load_errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() == MAX_RECENT_LOAD_ERRORS {
            errors.pop_front();
        }
        errors.push_back(LoadFailure {
            owner: owner.to_string(),
            class_scope: class_scope.clone(),
            version,
            error,
            at: Utc::now(),
        });
    }
}

/// Read, verify and validate one artifact
fn load_artifact(record: &ArtifactRecord) -> Result<LoadedModel, LoadError> {
    let path = Path::new(&record.path);
    let data = storage::read_file(path).map_err(|e| LoadError::Missing(format!("{}: {}", record.path, e)))?;

    let actual = calculate_sha256(&data);
    if actual != record.sha256 {
        return Err(LoadError::ChecksumMismatch {
            path: record.path.clone(),
            expected: record.sha256.clone(),
            actual,
        });
    }

    let weights = ModelWeights::from_json(&data)?;
    weights.validate()?;

    Ok(LoadedModel {
        owner: record.owner.clone(),
        class_scope: record.class_scope.clone(),
        version: record.version,
        weights,
        checksum: Some(record.sha256.clone()),
        created_at: record.created_at,
        metrics: Some(record.metrics.clone()),
    })
}
