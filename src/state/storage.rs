// File system layout for samples and model artifacts
// Every file is written to a temporary name and renamed into place
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to get app data directory")]
    NoAppDataDir,
    #[error("Invalid path component: {0:?}")]
    InvalidComponent(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Default data root: `<platform data dir>/com.aura.detect`
pub fn default_data_dir() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir().ok_or(StorageError::NoAppDataDir)?;
    Ok(data_dir.join("com.aura.detect"))
}

/// Make an owner, label or scope safe to use as a single directory name.
/// Anything outside `[A-Za-z0-9_.-]` becomes `_`, and a name that had to be
/// changed gets a hash suffix so that distinct names never share a directory.
pub fn sanitize_component(name: &str) -> StorageResult<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(StorageError::InvalidComponent(name.to_string()));
    }
    if cleaned == name {
        return Ok(cleaned);
    }

    let digest = calculate_sha256(name.as_bytes());
    Ok(format!("{}-{}", cleaned, &digest[..8]))
}

/// `samples/{owner}/{label}`
pub fn sample_dir(root: &Path, owner: &str, label: &str) -> StorageResult<PathBuf> {
    Ok(root
        .join("samples")
        .join(sanitize_component(owner)?)
        .join(sanitize_component(label)?))
}

/// `models/{owner}/{class_scope}`
pub fn scope_dir(root: &Path, owner: &str, class_scope: &str) -> StorageResult<PathBuf> {
    Ok(root
        .join("models")
        .join(sanitize_component(owner)?)
        .join(sanitize_component(class_scope)?))
}

/// `models/{owner}/{class_scope}/{version}`
pub fn model_dir(root: &Path, owner: &str, class_scope: &str, version: u32) -> StorageResult<PathBuf> {
    Ok(scope_dir(root, owner, class_scope)?.join(version.to_string()))
}

/// Sortable, filesystem-safe timestamp used as a file stem
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// First `{stem}.{ext}` (or `{stem}-{n}.{ext}`) that does not exist yet in `dir`
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", stem, ext));
    if !candidate.exists() {
        return candidate;
    }

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{}-{}.{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Write `data` to `path` through a temp file in the same directory and
/// return its SHA256. Readers never observe a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<String> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::InvalidComponent(path.display().to_string()))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| StorageError::InvalidComponent(path.display().to_string()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(calculate_sha256(data))
}

/// Read a file from disk
pub fn read_file(path: &Path) -> StorageResult<Vec<u8>> {
    Ok(fs::read(path)?)
}

/// Calculate SHA256 hash of data
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
