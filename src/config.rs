// Detector configuration
// JSON file with every field defaulted, validated before the pipeline starts

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::audio::capture::DeviceConfig;
use crate::audio::window::WindowConfig;
use crate::detection::trigger::{TriggerRule, DEFAULT_HISTORY_SIZE};
use crate::detection::types::ClassScope;
use crate::state::storage::{default_data_dir, write_atomic, StorageError};
use crate::training::collector::CollectionConfig;
use crate::training::trainer::TrainingParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to write config: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    /// Bounded frame queue between capture and processing
    pub queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 16000,
            channels: 1,
            frame_size: 1024,
            queue_capacity: 64,
            device: None,
        }
    }
}

impl AudioConfig {
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_size: self.frame_size,
            device_name: self.device.clone(),
        }
    }
}

/// Detection settings for one class scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassScopeConfig {
    pub detection_threshold: f32,
    pub cooldown_seconds: f64,
    /// Window duration D in seconds
    pub window_duration: f64,
    /// Hop H in seconds; D/4 when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_duration: Option<f64>,
    pub debounce_count: u32,
    pub history_size: usize,
    pub require_release: bool,
}

impl Default for ClassScopeConfig {
    fn default() -> Self {
        ClassScopeConfig {
            detection_threshold: 0.5,
            cooldown_seconds: 3.0,
            window_duration: 1.0,
            hop_duration: None,
            debounce_count: 2,
            history_size: DEFAULT_HISTORY_SIZE,
            require_release: false,
        }
    }
}

impl ClassScopeConfig {
    pub fn hop(&self) -> f64 {
        self.hop_duration.unwrap_or(self.window_duration / 4.0)
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig::new(self.window_duration, self.hop())
    }

    pub fn trigger_rule(&self, class_scope: ClassScope) -> TriggerRule {
        TriggerRule {
            class_scope,
            threshold: self.detection_threshold,
            debounce_count: self.debounce_count,
            cooldown_seconds: self.cooldown_seconds,
            require_release: self.require_release,
            history_size: self.history_size,
        }
    }

    fn validate(&self, scope: &ClassScope) -> Result<(), ConfigError> {
        let field = |name: &str| format!("class_scopes.{}.{}", scope, name);

        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(invalid(field("detection_threshold"), "must be within [0, 1]"));
        }
        if !(self.cooldown_seconds.is_finite() && self.cooldown_seconds >= 0.0) {
            return Err(invalid(field("cooldown_seconds"), "must be a non-negative number"));
        }
        if !(self.window_duration.is_finite() && self.window_duration > 0.0) {
            return Err(invalid(field("window_duration"), "must be positive"));
        }
        if !self.window_config().is_valid() {
            return Err(invalid(field("hop_duration"), "must satisfy 0 < hop <= window_duration"));
        }
        if self.history_size == 0 {
            return Err(invalid(field("history_size"), "must be at least 1"));
        }
        if self.debounce_count == 0 || self.debounce_count as usize > self.history_size {
            return Err(invalid(field("debounce_count"), "must be within [1, history_size]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Owner whose models serve detection and who owns collected samples
    pub owner: String,
    pub audio: AudioConfig,
    pub class_scopes: BTreeMap<ClassScope, ClassScopeConfig>,
    pub collection: CollectionConfig,
    pub training: TrainingParams,
    /// Data root; the platform data directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let mut class_scopes = BTreeMap::new();
        class_scopes.insert(ClassScope::hotword(), ClassScopeConfig::default());

        DetectorConfig {
            owner: "default".to_string(),
            audio: AudioConfig::default(),
            class_scopes,
            collection: CollectionConfig::default(),
            training: TrainingParams::default(),
            data_dir: None,
        }
    }
}

impl DetectorConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: DetectorConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `load` when the file exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner.trim().is_empty() {
            return Err(invalid("owner", "must not be empty"));
        }
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if self.audio.channels == 0 {
            return Err(invalid("audio.channels", "must be positive"));
        }
        if self.audio.frame_size == 0 {
            return Err(invalid("audio.frame_size", "must be positive"));
        }
        if self.audio.queue_capacity == 0 {
            return Err(invalid("audio.queue_capacity", "must be positive"));
        }
        if self.class_scopes.is_empty() {
            return Err(invalid("class_scopes", "at least one class scope is required"));
        }
        for (scope, scope_config) in &self.class_scopes {
            if scope.as_str().trim().is_empty() {
                return Err(invalid("class_scopes", "scope names must not be empty"));
            }
            scope_config.validate(scope)?;
        }

        let collection = &self.collection;
        if !(collection.sample_duration.is_finite() && collection.sample_duration > 0.0) {
            return Err(invalid("collection.sample_duration", "must be positive"));
        }
        if !(collection.min_sample_duration.is_finite() && collection.min_sample_duration >= 0.0) {
            return Err(invalid("collection.min_sample_duration", "must be non-negative"));
        }

        self.training
            .validate()
            .map_err(|e| invalid("training", e.to_string()))?;
        Ok(())
    }

    pub fn data_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(default_data_dir()?),
        }
    }

    pub fn scopes(&self) -> Vec<ClassScope> {
        self.class_scopes.keys().cloned().collect()
    }

    pub fn trigger_rules(&self) -> Vec<TriggerRule> {
        self.class_scopes
            .iter()
            .map(|(scope, c)| c.trigger_rule(scope.clone()))
            .collect()
    }

    pub fn scope(&self, class_scope: &ClassScope) -> Option<&ClassScopeConfig> {
        self.class_scopes.get(class_scope)
    }
}
