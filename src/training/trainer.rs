// Model training
// Fits a per-owner model from labeled samples on a background thread and
// publishes it through the registry

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use uuid::Uuid;

use crate::audio::features::{FeatureExtractor, FeatureVector, FEATURE_DIM};
use crate::audio::frame::samples_for;
use crate::detection::model::{sigmoid, ModelWeights, ValidationMetrics};
use crate::detection::types::ClassScope;
use crate::state::models::{ArtifactRecord, Sample};
use crate::state::registry::{ModelRegistry, RegistryError};
use crate::state::store::StoreError;
use crate::training::trace::{TraceEntry, TraceWriter, TrainingStage};

/// Standardization floor so constant features do not blow up
const MIN_SCALE: f64 = 1e-4;

const LOSS_EPSILON: f64 = 1e-7;

const TRACE_FILE_NAME: &str = "training.jsonl";

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(
        "Insufficient training data: {positives} positive and {negatives} negative samples, need {required} of each"
    )]
    InsufficientData {
        positives: usize,
        negatives: usize,
        required: usize,
    },

    #[error("Invalid training parameters: {0}")]
    InvalidParams(String),

    #[error("Training diverged at epoch {epoch}")]
    Diverged { epoch: usize },

    #[error("Training cancelled")]
    Cancelled,

    #[error("Failed to fit model: {0}")]
    Fit(String),

    #[error("Failed to publish model: {0}")]
    Publish(#[from] RegistryError),

    #[error("Failed to read samples: {0}")]
    Samples(#[from] StoreError),

    #[error("Training thread failed: {0}")]
    Thread(String),
}

/// Hyperparameters for one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// L2 penalty on the coefficients
    pub l2: f32,
    /// Fraction of each class's samples held out for validation
    pub validation_split: f32,
    /// N_min: required positive and negative samples
    pub min_samples_per_class: usize,
    /// Seed for the split and batch shuffling
    pub seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            epochs: 10,
            batch_size: 32,
            learning_rate: 0.1,
            l2: 1e-3,
            validation_split: 0.2,
            min_samples_per_class: 5,
            seed: 42,
        }
    }
}

impl TrainingParams {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidParams("epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidParams("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainingError::InvalidParams(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(TrainingError::InvalidParams(format!("l2 must be non-negative, got {}", self.l2)));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(TrainingError::InvalidParams(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if self.min_samples_per_class == 0 {
            return Err(TrainingError::InvalidParams(
                "min_samples_per_class must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Preparing,
    Training,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingProgress {
    pub state: JobState,
    pub epoch: usize,
    pub total_epochs: usize,
    pub train_loss: Option<f32>,
    pub validation_loss: Option<f32>,
}

impl TrainingProgress {
    fn new(total_epochs: usize) -> Self {
        TrainingProgress {
            state: JobState::Preparing,
            epoch: 0,
            total_epochs,
            train_loss: None,
            validation_loss: None,
        }
    }

    pub fn fraction(&self) -> f32 {
        if self.state == JobState::Completed {
            return 1.0;
        }
        if self.total_epochs == 0 {
            return 0.0;
        }
        self.epoch as f32 / self.total_epochs as f32
    }
}

/// Result of a finished training job
#[derive(Debug)]
pub struct TrainingOutcome {
    pub job_id: Uuid,
    pub owner: String,
    pub class_scope: ClassScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Result<ArtifactRecord, TrainingError>,
}

impl TrainingOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn artifact(&self) -> Option<&ArtifactRecord> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TrainingError> {
        self.result.as_ref().err()
    }

    pub fn metrics(&self) -> Option<&ValidationMetrics> {
        self.artifact().map(|a| &a.metrics)
    }
}

/// Handle to a running (or already finished) training job
pub struct TrainingJob {
    id: Uuid,
    owner: String,
    class_scope: ClassScope,
    started_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
    progress: Arc<Mutex<TrainingProgress>>,
    handle: Option<JoinHandle<TrainingOutcome>>,
    ready: Option<TrainingOutcome>,
}

impl TrainingJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn class_scope(&self) -> &ClassScope {
        &self.class_scope
    }

    /// Request cancellation; honored between batches
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    pub fn progress(&self) -> TrainingProgress {
        self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Block until the job ends
    pub fn wait(mut self) -> TrainingOutcome {
        if let Some(outcome) = self.ready.take() {
            return outcome;
        }

        let joined = match self.handle.take() {
            Some(handle) => handle.join(),
            None => Err(Box::new("training job has no worker") as Box<dyn std::any::Any + Send>),
        };

        joined.unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Training job {} panicked: {}", self.id, message);

            TrainingOutcome {
                job_id: self.id,
                owner: self.owner.clone(),
                class_scope: self.class_scope.clone(),
                started_at: self.started_at,
                finished_at: Utc::now(),
                result: Err(TrainingError::Thread(message)),
            }
        })
    }
}

/// Starts training jobs and hands their results to the registry
pub struct TrainingManager {
    registry: Arc<ModelRegistry>,
    extractor: FeatureExtractor,
    window_durations: BTreeMap<ClassScope, f64>,
}

impl TrainingManager {
    pub fn new(registry: Arc<ModelRegistry>, extractor: FeatureExtractor) -> Self {
        TrainingManager {
            registry,
            extractor,
            window_durations: BTreeMap::new(),
        }
    }

    /// Window duration used to slice samples for a scope (default 1 s)
    pub fn set_window_duration(&mut self, class_scope: ClassScope, seconds: f64) {
        self.window_durations.insert(class_scope, seconds);
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Fit a new model for (owner, class_scope) in the background.
    ///
    /// Parameter and data-size checks happen before any work is started; a
    /// job that fails them is returned already finished.
    pub fn train_async(
        &self,
        owner: &str,
        class_scope: &ClassScope,
        samples: Vec<Sample>,
        params: TrainingParams,
    ) -> TrainingJob {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let progress = Arc::new(Mutex::new(TrainingProgress::new(params.epochs)));
        let cancel = Arc::new(AtomicBool::new(false));

        let finished = |result: Result<ArtifactRecord, TrainingError>| TrainingJob {
            id,
            owner: owner.to_string(),
            class_scope: class_scope.clone(),
            started_at,
            cancel: Arc::clone(&cancel),
            progress: Arc::clone(&progress),
            handle: None,
            ready: Some(TrainingOutcome {
                job_id: id,
                owner: owner.to_string(),
                class_scope: class_scope.clone(),
                started_at,
                finished_at: Utc::now(),
                result,
            }),
        };

        let precheck = params
            .validate()
            .and_then(|_| check_class_counts(&samples, class_scope, params.min_samples_per_class));
        if let Err(e) = precheck {
            log::warn!("Training {}/{} rejected: {}", owner, class_scope, e);
            lock_progress(&progress).state = JobState::Failed;
            return finished(Err(e));
        }

        let trace = match self.registry.store().scope_dir(owner, class_scope) {
            Ok(dir) => Some(TraceWriter::new(dir.join(TRACE_FILE_NAME))),
            Err(e) => {
                log::warn!("Training trace disabled: {}", e);
                None
            }
        };

        let ctx = JobContext {
            id,
            owner: owner.to_string(),
            class_scope: class_scope.clone(),
            started_at,
            samples,
            params,
            window_duration: self.window_durations.get(class_scope).copied().unwrap_or(1.0),
            extractor: self.extractor.clone(),
            registry: Arc::clone(&self.registry),
            cancel: Arc::clone(&cancel),
            progress: Arc::clone(&progress),
            trace,
        };

        let spawned = thread::Builder::new()
            .name(format!("training-{}", class_scope))
            .spawn(move || run_job(ctx));

        match spawned {
            Ok(handle) => {
                log::info!("Training job {} started for {}/{}", id, owner, class_scope);
                TrainingJob {
                    id,
                    owner: owner.to_string(),
                    class_scope: class_scope.clone(),
                    started_at,
                    cancel: Arc::clone(&cancel),
                    progress: Arc::clone(&progress),
                    handle: Some(handle),
                    ready: None,
                }
            }
            Err(e) => {
                lock_progress(&progress).state = JobState::Failed;
                finished(Err(TrainingError::Thread(e.to_string())))
            }
        }
    }
}

fn lock_progress(progress: &Mutex<TrainingProgress>) -> std::sync::MutexGuard<'_, TrainingProgress> {
    progress.lock().unwrap_or_else(|e| e.into_inner())
}

fn check_class_counts(samples: &[Sample], class_scope: &ClassScope, required: usize) -> Result<(), TrainingError> {
    let positives = samples.iter().filter(|s| s.is_positive_for(class_scope)).count();
    let negatives = samples.len() - positives;

    if positives < required || negatives < required {
        return Err(TrainingError::InsufficientData {
            positives,
            negatives,
            required,
        });
    }
    Ok(())
}

struct JobContext {
    id: Uuid,
    owner: String,
    class_scope: ClassScope,
    started_at: DateTime<Utc>,
    samples: Vec<Sample>,
    params: TrainingParams,
    window_duration: f64,
    extractor: FeatureExtractor,
    registry: Arc<ModelRegistry>,
    cancel: Arc<AtomicBool>,
    progress: Arc<Mutex<TrainingProgress>>,
    trace: Option<TraceWriter>,
}

impl JobContext {
    fn trace(&self, entry: TraceEntry) {
        if let Some(writer) = &self.trace {
            writer.write_or_log(&entry);
        }
    }

    fn set_state(&self, state: JobState) {
        lock_progress(&self.progress).state = state;
    }
}

fn run_job(ctx: JobContext) -> TrainingOutcome {
    ctx.trace(
        TraceEntry::new(ctx.id, TrainingStage::Preparing, 0.0, "Preparing training data").with_data(
            serde_json::json!({
                "samples": ctx.samples.len(),
                "epochs": ctx.params.epochs,
                "window_duration": ctx.window_duration,
            }),
        ),
    );

    let result = train_and_publish(&ctx);

    let (state, stage, message) = match &result {
        Ok(record) => (
            JobState::Completed,
            TrainingStage::Completed,
            format!("Published and activated version {}", record.version),
        ),
        Err(TrainingError::Cancelled) => (
            JobState::Cancelled,
            TrainingStage::Cancelled,
            "Training cancelled".to_string(),
        ),
        Err(e) => (JobState::Failed, TrainingStage::Failed, e.to_string()),
    };

    ctx.set_state(state);
    let progress = lock_progress(&ctx.progress).fraction();
    ctx.trace(TraceEntry::new(ctx.id, stage, progress, message.clone()));

    match &result {
        Ok(_) => log::info!("Training job {} for {}/{}: {}", ctx.id, ctx.owner, ctx.class_scope, message),
        Err(_) => log::warn!("Training job {} for {}/{}: {}", ctx.id, ctx.owner, ctx.class_scope, message),
    }

    TrainingOutcome {
        job_id: ctx.id,
        owner: ctx.owner.clone(),
        class_scope: ctx.class_scope.clone(),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        result,
    }
}

fn train_and_publish(ctx: &JobContext) -> Result<ArtifactRecord, TrainingError> {
    let split = split_samples(&ctx.samples, &ctx.class_scope, &ctx.params);
    let to_vectors = |samples: &[&Sample]| -> Vec<(FeatureVector, f32)> {
        samples
            .iter()
            .flat_map(|s| {
                let label = if s.is_positive_for(&ctx.class_scope) { 1.0 } else { 0.0 };
                sample_vectors(&ctx.extractor, s, ctx.window_duration)
                    .into_iter()
                    .map(move |v| (v, label))
            })
            .collect()
    };

    let train = to_vectors(&split.train);
    let validation = to_vectors(&split.validation);
    if ctx.cancel.load(Ordering::SeqCst) {
        return Err(TrainingError::Cancelled);
    }

    ctx.set_state(JobState::Training);
    let (weights, mut metrics) = fit(&train, &validation, &ctx.params, &ctx.cancel, |report| {
        {
            let mut progress = lock_progress(&ctx.progress);
            progress.epoch = report.epoch;
            progress.train_loss = Some(report.train_loss);
            progress.validation_loss = report.validation_loss;
        }
        log::debug!(
            "Epoch {}/{}: train loss {:.4}, validation loss {:?}",
            report.epoch,
            report.total_epochs,
            report.train_loss,
            report.validation_loss
        );
        ctx.trace(
            TraceEntry::new(
                ctx.id,
                TrainingStage::Epoch,
                report.epoch as f32 / report.total_epochs.max(1) as f32,
                format!("Epoch {}/{}", report.epoch, report.total_epochs),
            )
            .with_data(serde_json::json!({
                "train_loss": report.train_loss,
                "validation_loss": report.validation_loss,
            })),
        );
    })?;

    metrics.positive_samples = split.positives;
    metrics.negative_samples = split.negatives;

    if ctx.cancel.load(Ordering::SeqCst) {
        return Err(TrainingError::Cancelled);
    }

    ctx.set_state(JobState::Publishing);
    ctx.trace(TraceEntry::new(ctx.id, TrainingStage::Publishing, 1.0, "Publishing model"));

    let record = ctx
        .registry
        .publish(&ctx.owner, &ctx.class_scope, &weights, &metrics)?;
    ctx.registry.activate(&ctx.owner, &ctx.class_scope, record.version)?;

    Ok(record)
}

struct SampleSplit<'a> {
    train: Vec<&'a Sample>,
    validation: Vec<&'a Sample>,
    positives: usize,
    negatives: usize,
}

/// Stratified, seeded split by sample so windows of one recording never
/// land on both sides
fn split_samples<'a>(samples: &'a [Sample], class_scope: &ClassScope, params: &TrainingParams) -> SampleSplit<'a> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let (mut positives, mut negatives): (Vec<&Sample>, Vec<&Sample>) =
        samples.iter().partition(|s| s.is_positive_for(class_scope));
    positives.shuffle(&mut rng);
    negatives.shuffle(&mut rng);

    let mut split = SampleSplit {
        train: Vec::new(),
        validation: Vec::new(),
        positives: positives.len(),
        negatives: negatives.len(),
    };

    for class in [positives, negatives] {
        let n = class.len();
        let held_out = if params.validation_split > 0.0 && n >= 2 {
            ((n as f32 * params.validation_split).round() as usize).clamp(1, n - 1)
        } else {
            0
        };
        split.validation.extend_from_slice(&class[..held_out]);
        split.train.extend_from_slice(&class[held_out..]);
    }

    split
}

/// Slice a sample into windows of `window_duration` with 50% overlap.
/// Samples shorter than one window yield a single vector.
pub fn sample_vectors(extractor: &FeatureExtractor, sample: &Sample, window_duration: f64) -> Vec<FeatureVector> {
    if sample.audio.is_empty() || sample.sample_rate == 0 {
        return Vec::new();
    }

    let window = samples_for(window_duration, sample.sample_rate).max(1);
    if sample.audio.len() <= window {
        return vec![extractor.extract_samples(&sample.audio, sample.sample_rate)];
    }

    let hop = (window / 2).max(1);
    (0..=sample.audio.len() - window)
        .step_by(hop)
        .map(|start| extractor.extract_samples(&sample.audio[start..start + window], sample.sample_rate))
        .collect()
}

/// Per-epoch report passed to the progress callback
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    pub epoch: usize,
    pub total_epochs: usize,
    pub train_loss: f32,
    pub validation_loss: Option<f32>,
}

/// Standardized logistic regression by mini-batch gradient descent.
/// Metrics are computed on the validation set, or the training set when
/// nothing was held out.
pub fn fit(
    train: &[(FeatureVector, f32)],
    validation: &[(FeatureVector, f32)],
    params: &TrainingParams,
    cancel: &AtomicBool,
    mut on_epoch: impl FnMut(EpochReport),
) -> Result<(ModelWeights, ValidationMetrics), TrainingError> {
    if train.is_empty() {
        return Err(TrainingError::Fit("no training vectors".to_string()));
    }

    let (mean, scale) = standardization(train);
    let standardize = |v: &FeatureVector| -> Vec<f64> {
        v.values()
            .iter()
            .enumerate()
            .map(|(i, &x)| (x as f64 - mean[i]) / scale[i])
            .collect()
    };

    let train_x: Vec<Vec<f64>> = train.iter().map(|(v, _)| standardize(v)).collect();
    let train_y: Vec<f64> = train.iter().map(|(_, y)| *y as f64).collect();
    let val_x: Vec<Vec<f64>> = validation.iter().map(|(v, _)| standardize(v)).collect();
    let val_y: Vec<f64> = validation.iter().map(|(_, y)| *y as f64).collect();

    let lr = params.learning_rate as f64;
    let l2 = params.l2 as f64;
    let mut w = vec![0.0f64; FEATURE_DIM];
    let mut b = 0.0f64;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut order: Vec<usize> = (0..train_x.len()).collect();
    let mut train_loss = f64::NAN;
    let mut validation_loss = None;

    for epoch in 1..=params.epochs {
        order.shuffle(&mut rng);

        for batch in order.chunks(params.batch_size) {
            if cancel.load(Ordering::SeqCst) {
                return Err(TrainingError::Cancelled);
            }

            let mut grad_w = vec![0.0f64; FEATURE_DIM];
            let mut grad_b = 0.0f64;
            for &i in batch {
                let err = predict(&w, b, &train_x[i]) - train_y[i];
                for (g, x) in grad_w.iter_mut().zip(&train_x[i]) {
                    *g += err * x;
                }
                grad_b += err;
            }

            let n = batch.len() as f64;
            for (wj, g) in w.iter_mut().zip(&grad_w) {
                *wj -= lr * (g / n + l2 * *wj);
            }
            b -= lr * grad_b / n;
        }

        train_loss = loss(&w, b, &train_x, &train_y, l2);
        if !train_loss.is_finite() || w.iter().any(|x| !x.is_finite()) || !b.is_finite() {
            return Err(TrainingError::Diverged { epoch });
        }

        validation_loss = if val_x.is_empty() {
            None
        } else {
            let v = loss(&w, b, &val_x, &val_y, 0.0);
            if !v.is_finite() {
                return Err(TrainingError::Diverged { epoch });
            }
            Some(v as f32)
        };

        on_epoch(EpochReport {
            epoch,
            total_epochs: params.epochs,
            train_loss: train_loss as f32,
            validation_loss,
        });
    }

    let (eval_x, eval_y) = if val_x.is_empty() {
        (&train_x, &train_y)
    } else {
        (&val_x, &val_y)
    };
    let mut metrics = classification_metrics(&w, b, eval_x, eval_y);
    metrics.train_loss = train_loss as f32;
    metrics.validation_loss = validation_loss.unwrap_or(train_loss as f32);
    metrics.train_vectors = train_x.len();
    metrics.validation_vectors = val_x.len();
    metrics.epochs = params.epochs;

    let weights = ModelWeights {
        feature_dim: FEATURE_DIM,
        mean: mean.iter().map(|&m| m as f32).collect(),
        scale: scale.iter().map(|&s| s as f32).collect(),
        coefficients: w.iter().map(|&x| x as f32).collect(),
        bias: b as f32,
    };

    Ok((weights, metrics))
}

fn standardization(train: &[(FeatureVector, f32)]) -> (Vec<f64>, Vec<f64>) {
    let n = train.len() as f64;
    let mut mean = vec![0.0f64; FEATURE_DIM];
    for (v, _) in train {
        for (m, &x) in mean.iter_mut().zip(v.values()) {
            *m += x as f64 / n;
        }
    }

    let mut var = vec![0.0f64; FEATURE_DIM];
    for (v, _) in train {
        for ((s, &x), m) in var.iter_mut().zip(v.values()).zip(&mean) {
            *s += (x as f64 - m).powi(2) / n;
        }
    }

    let scale = var.iter().map(|v| v.sqrt().max(MIN_SCALE)).collect();
    (mean, scale)
}

fn predict(w: &[f64], b: f64, x: &[f64]) -> f64 {
    let z = b + w.iter().zip(x).map(|(wi, xi)| wi * xi).sum::<f64>();
    sigmoid(z as f32) as f64
}

fn loss(w: &[f64], b: f64, xs: &[Vec<f64>], ys: &[f64], l2: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }

    let bce: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, &y)| {
            let p = predict(w, b, x).clamp(LOSS_EPSILON, 1.0 - LOSS_EPSILON);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum::<f64>()
        / xs.len() as f64;

    bce + 0.5 * l2 * w.iter().map(|x| x * x).sum::<f64>()
}

fn classification_metrics(w: &[f64], b: f64, xs: &[Vec<f64>], ys: &[f64]) -> ValidationMetrics {
    let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
    for (x, &y) in xs.iter().zip(ys) {
        let predicted = predict(w, b, x) > 0.5;
        match (predicted, y > 0.5) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ValidationMetrics {
        accuracy: ratio(tp + tn, xs.len()),
        precision,
        recall,
        f1,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::LOUDNESS_INDEX;

    fn vector(loudness: f32, band: f32) -> FeatureVector {
        let mut values = vec![0.0; FEATURE_DIM];
        values[LOUDNESS_INDEX] = loudness;
        values[3] = band;
        FeatureVector::from_values(values).unwrap()
    }

    fn separable(n: usize) -> Vec<(FeatureVector, f32)> {
        (0..n)
            .flat_map(|i| {
                let jitter = i as f32 * 0.01;
                [(vector(0.8 + jitter, 0.6), 1.0), (vector(0.2 + jitter, 0.1), 0.0)]
            })
            .collect()
    }

    #[test]
    fn test_fit_separates_classes() {
        let data = separable(10);
        let cancel = AtomicBool::new(false);
        let mut epochs = 0;
        let params = TrainingParams {
            epochs: 30,
            ..Default::default()
        };

        let (weights, metrics) = fit(&data, &[], &params, &cancel, |_| epochs += 1).unwrap();

        assert_eq!(epochs, 30);
        assert!(weights.validate().is_ok());
        assert_eq!(metrics.accuracy, 1.0);
        assert!(weights.probability(&vector(0.85, 0.6)) > 0.5);
        assert!(weights.probability(&vector(0.15, 0.1)) < 0.5);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let data = separable(8);
        let cancel = AtomicBool::new(false);
        let params = TrainingParams::default();

        let (a, _) = fit(&data, &[], &params, &cancel, |_| {}).unwrap();
        let (b, _) = fit(&data, &[], &params, &cancel, |_| {}).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fit_honors_cancellation() {
        let cancel = AtomicBool::new(true);
        let result = fit(&separable(4), &[], &TrainingParams::default(), &cancel, |_| {});
        assert!(matches!(result, Err(TrainingError::Cancelled)));
    }

    #[test]
    fn test_divergence_detected() {
        let params = TrainingParams {
            learning_rate: f32::MAX,
            epochs: 5,
            l2: f32::MAX,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let result = fit(&separable(10), &[], &params, &cancel, |_| {});
        assert!(matches!(result, Err(TrainingError::Diverged { .. })));
    }

    #[test]
    fn test_params_validation() {
        assert!(TrainingParams::default().validate().is_ok());
        assert!(TrainingParams { epochs: 0, ..Default::default() }.validate().is_err());
        assert!(TrainingParams { validation_split: 1.0, ..Default::default() }.validate().is_err());
        assert!(TrainingParams { learning_rate: f32::NAN, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_class_counts() {
        let scope = ClassScope::hotword();
        let mut samples: Vec<Sample> = (0..5).map(|_| Sample::new("a", "positive", vec![0.1; 10], 16000)).collect();
        samples.extend((0..4).map(|_| Sample::new("a", "noise", vec![0.1; 10], 16000)));

        assert!(matches!(
            check_class_counts(&samples, &scope, 5),
            Err(TrainingError::InsufficientData { positives: 5, negatives: 4, required: 5 })
        ));
        samples.push(Sample::new("a", "noise", vec![0.1; 10], 16000));
        assert!(check_class_counts(&samples, &scope, 5).is_ok());
    }

    #[test]
    fn test_split_is_stratified() {
        let scope = ClassScope::hotword();
        let mut samples: Vec<Sample> = (0..10).map(|_| Sample::new("a", "hotword", vec![0.1; 10], 16000)).collect();
        samples.extend((0..5).map(|_| Sample::new("a", "noise", vec![0.1; 10], 16000)));

        let split = split_samples(&samples, &scope, &TrainingParams::default());
        let held_pos = split.validation.iter().filter(|s| s.is_positive_for(&scope)).count();
        assert_eq!(held_pos, 2);
        assert_eq!(split.validation.len(), 3);
        assert_eq!(split.train.len(), 12);
    }

    #[test]
    fn test_sample_vectors_window_count() {
        let extractor = FeatureExtractor::new();
        let long = Sample::new("a", "x", vec![0.1; 32000], 16000);
        // 2 s at D = 1 s, hop 0.5 s -> starts at 0, 0.5, 1.0
        assert_eq!(sample_vectors(&extractor, &long, 1.0).len(), 3);

        let short = Sample::new("a", "x", vec![0.1; 4000], 16000);
        assert_eq!(sample_vectors(&extractor, &short, 1.0).len(), 1);
    }
}
