// Persistent store: SQLite index plus the sample and model file tree
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use super::db::{DbConnection, DbError};
use super::models::{ActiveModelRecord, ArtifactRecord, Sample, SampleMetadata, SampleRecord};
use super::queries;
use super::storage::{
    self, calculate_sha256, file_timestamp, model_dir, sample_dir, scope_dir, unique_path,
    StorageError,
};
use crate::audio::ingest::{decode_wav, encode_wav, AudioError};
use crate::detection::model::{ModelWeights, ValidationMetrics};
use crate::detection::types::ClassScope;

const DB_FILE_NAME: &str = "aura.db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Sample {id} is corrupt: {reason}")]
    CorruptSample { id: Uuid, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Data root with its database
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    db: DbConnection,
}

impl Store {
    /// Open the store rooted at `root`, creating directories and schema as needed
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(StorageError::from)?;
        let db = DbConnection::open(&root.join(DB_FILE_NAME))?;

        log::info!("Opened data store at {}", root.display());
        Ok(Store { root, db })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    /// Directory holding the versions and training trace for a scope
    pub fn scope_dir(&self, owner: &str, class_scope: &ClassScope) -> StoreResult<PathBuf> {
        Ok(scope_dir(&self.root, owner, class_scope.as_str())?)
    }

    // ==================== SAMPLES ====================

    /// Persist raw mono audio as `samples/{owner}/{label}/{timestamp}.wav`
    pub fn save_sample(
        &self,
        owner: &str,
        label: &str,
        audio: &[f32],
        sample_rate: u32,
        metadata: SampleMetadata,
    ) -> StoreResult<SampleRecord> {
        let created_at = Utc::now();
        let dir = sample_dir(&self.root, owner, label)?;
        std::fs::create_dir_all(&dir).map_err(StorageError::from)?;
        let path = unique_path(&dir, &file_timestamp(created_at), "wav");

        let wav = encode_wav(audio, sample_rate)?;
        let sha256 = storage::write_atomic(&path, &wav)?;

        let record = SampleRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            label: label.to_string(),
            path: path.to_string_lossy().into_owned(),
            sha256,
            sample_rate,
            num_samples: audio.len() as u64,
            created_at,
            metadata,
        };

        if let Err(e) = queries::insert_sample(&self.db, &record) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        log::debug!(
            "Saved sample {} ({}/{}, {:.2}s)",
            record.id,
            owner,
            label,
            record.duration_secs()
        );
        Ok(record)
    }

    pub fn list_samples(&self, owner: &str, label: Option<&str>) -> StoreResult<Vec<SampleRecord>> {
        Ok(queries::list_samples(&self.db, owner, label)?)
    }

    pub fn get_sample(&self, id: &Uuid) -> StoreResult<Option<SampleRecord>> {
        Ok(queries::get_sample(&self.db, id)?)
    }

    /// Sample count per label, sorted by label
    pub fn sample_counts(&self, owner: &str) -> StoreResult<Vec<(String, u64)>> {
        Ok(queries::count_samples_by_label(&self.db, owner)?)
    }

    /// Read a sample's audio, verifying its checksum
    pub fn load_sample(&self, record: &SampleRecord) -> StoreResult<Sample> {
        let data = storage::read_file(Path::new(&record.path))?;

        let actual = calculate_sha256(&data);
        if actual != record.sha256 {
            return Err(StoreError::CorruptSample {
                id: record.id,
                reason: format!("checksum {} does not match {}", actual, record.sha256),
            });
        }

        let audio = decode_wav(&data)?;
        Ok(Sample {
            id: record.id,
            owner: record.owner.clone(),
            label: record.label.clone(),
            audio: audio.samples,
            sample_rate: audio.sample_rate,
            timestamp: record.created_at,
            metadata: record.metadata.clone(),
        })
    }

    /// Every readable sample of an owner. Unreadable ones are logged and skipped.
    pub fn load_samples(&self, owner: &str) -> StoreResult<Vec<Sample>> {
        let records = self.list_samples(owner, None)?;
        let mut samples = Vec::with_capacity(records.len());

        for record in &records {
            match self.load_sample(record) {
                Ok(sample) => samples.push(sample),
                Err(e) => log::warn!("Skipping sample {}: {}", record.id, e),
            }
        }

        Ok(samples)
    }

    // ==================== MODEL ARTIFACTS ====================

    /// Write weights and the metrics sidecar for a new version and index them.
    /// The version must not exist yet.
    pub fn write_artifact(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        version: u32,
        weights: &ModelWeights,
        metrics: &ValidationMetrics,
    ) -> StoreResult<ArtifactRecord> {
        let created_at = Utc::now();
        let dir = model_dir(&self.root, owner, class_scope.as_str(), version)?;
        let stem = file_timestamp(created_at);

        let weights_json = weights.to_json()?;
        let path = dir.join(format!("{}.json", stem));
        let sha256 = storage::write_atomic(&path, &weights_json)?;

        let metrics_json = serde_json::to_vec_pretty(metrics)?;
        let metrics_path = dir.join(format!("{}.metrics.json", stem));
        storage::write_atomic(&metrics_path, &metrics_json)?;

        let record = ArtifactRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            class_scope: class_scope.clone(),
            version,
            path: path.to_string_lossy().into_owned(),
            metrics_path: Some(metrics_path.to_string_lossy().into_owned()),
            sha256,
            bytes: weights_json.len() as i64,
            created_at,
            metrics: metrics.clone(),
        };

        if let Err(e) = queries::insert_artifact(&self.db, &record) {
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(&metrics_path);
            return Err(e.into());
        }
        Ok(record)
    }

    pub fn next_model_version(&self, owner: &str, class_scope: &ClassScope) -> StoreResult<u32> {
        Ok(queries::next_model_version(&self.db, owner, class_scope)?)
    }

    pub fn list_artifacts(&self, owner: &str, class_scope: &ClassScope) -> StoreResult<Vec<ArtifactRecord>> {
        Ok(queries::list_artifacts(&self.db, owner, class_scope)?)
    }

    pub fn get_artifact(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        version: u32,
    ) -> StoreResult<Option<ArtifactRecord>> {
        Ok(queries::get_artifact(&self.db, owner, class_scope, version)?)
    }

    pub fn active_version(&self, owner: &str, class_scope: &ClassScope) -> StoreResult<Option<u32>> {
        Ok(queries::get_active_version(&self.db, owner, class_scope)?)
    }

    pub fn set_active_version(&self, owner: &str, class_scope: &ClassScope, version: u32) -> StoreResult<()> {
        Ok(queries::set_active_version(&self.db, owner, class_scope, version)?)
    }

    /// Persisted active versions of every scope an owner has activated
    pub fn active_models(&self, owner: &str) -> StoreResult<Vec<ActiveModelRecord>> {
        Ok(queries::list_active(&self.db, owner)?)
    }
}
