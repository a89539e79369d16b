// Training history trace
// Append-only JSONL file next to a scope's artifacts, one line per training event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Phase of a training job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    Preparing,
    Epoch,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

/// One line of the training history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,

    pub job_id: Uuid,

    pub stage: TrainingStage,

    /// Fraction of the job completed, [0.0, 1.0]
    pub progress: f32,

    pub message: String,

    /// Losses, counts, version; whatever the stage has to report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(job_id: Uuid, stage: TrainingStage, progress: f32, message: impl Into<String>) -> Self {
        TraceEntry {
            timestamp: Utc::now(),
            job_id,
            stage,
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize to JSON line (with newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Appends entries to `models/{owner}/{class_scope}/training.jsonl`
pub struct TraceWriter {
    file_path: PathBuf,
}

impl TraceWriter {
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter { file_path }
    }

    /// Append one entry, creating the file and its directory if needed
    pub fn write(&self, entry: &TraceEntry) -> Result<(), TraceError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;

        file.write_all(entry.to_json_line()?.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Trace writes never fail a training job
    pub fn write_or_log(&self, entry: &TraceEntry) {
        if let Err(e) = self.write(entry) {
            log::warn!("Failed to write training trace {}: {}", self.file_path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Read every entry of a trace file
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let contents = std::fs::read_to_string(path)?;

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TraceError::from))
        .collect()
}
