// Database CRUD operations
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::db::{DbConnection, DbResult};
use super::models::{ActiveModelRecord, ArtifactRecord, SampleMetadata, SampleRecord};
use crate::detection::model::ValidationMetrics;
use crate::detection::types::ClassScope;

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

// ==================== SAMPLE QUERIES ====================

const SAMPLE_COLUMNS: &str =
    "id, owner, label, path, sha256, sample_rate, num_samples, created_at, metadata_json";

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<SampleRecord> {
    Ok(SampleRecord {
        id: get_uuid(row, 0)?,
        owner: row.get(1)?,
        label: row.get(2)?,
        path: row.get(3)?,
        sha256: row.get(4)?,
        sample_rate: row.get(5)?,
        num_samples: row.get::<_, i64>(6)?.max(0) as u64,
        created_at: get_time(row, 7)?,
        metadata: get_json::<SampleMetadata>(row, 8)?,
    })
}

/// Index a persisted sample
pub fn insert_sample(db: &DbConnection, sample: &SampleRecord) -> DbResult<()> {
    let metadata_json = serde_json::to_string(&sample.metadata)
        .map_err(|e| conversion_error(8, e))?;

    let conn = db.lock();
    conn.execute(
        "INSERT INTO samples (id, owner, label, path, sha256, sample_rate, num_samples, created_at, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            sample.id.to_string(),
            sample.owner,
            sample.label,
            sample.path,
            sample.sha256,
            sample.sample_rate,
            sample.num_samples as i64,
            format_time(&sample.created_at),
            metadata_json,
        ],
    )?;

    Ok(())
}

/// Get a sample by ID
pub fn get_sample(db: &DbConnection, id: &Uuid) -> DbResult<Option<SampleRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!("SELECT {} FROM samples WHERE id = ?1", SAMPLE_COLUMNS))?;
    Ok(stmt.query_row([id.to_string()], sample_from_row).optional()?)
}

/// Samples for an owner, oldest first, optionally restricted to one label
pub fn list_samples(
    db: &DbConnection,
    owner: &str,
    label: Option<&str>,
) -> DbResult<Vec<SampleRecord>> {
    let conn = db.lock();

    let samples = match label {
        Some(label) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM samples WHERE owner = ?1 AND label = ?2 ORDER BY created_at ASC",
                SAMPLE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![owner, label], sample_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM samples WHERE owner = ?1 ORDER BY created_at ASC",
                SAMPLE_COLUMNS
            ))?;
            let rows = stmt.query_map([owner], sample_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(samples)
}

/// Number of samples per label for an owner
pub fn count_samples_by_label(db: &DbConnection, owner: &str) -> DbResult<Vec<(String, u64)>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT label, COUNT(*) FROM samples WHERE owner = ?1 GROUP BY label ORDER BY label",
    )?;

    let counts = stmt
        .query_map([owner], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(counts)
}

// ==================== ARTIFACT QUERIES ====================

const ARTIFACT_COLUMNS: &str =
    "id, owner, class_scope, version, path, metrics_path, sha256, bytes, created_at, metrics_json";

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        id: get_uuid(row, 0)?,
        owner: row.get(1)?,
        class_scope: ClassScope::new(row.get::<_, String>(2)?),
        version: row.get(3)?,
        path: row.get(4)?,
        metrics_path: row.get(5)?,
        sha256: row.get(6)?,
        bytes: row.get(7)?,
        created_at: get_time(row, 8)?,
        metrics: get_json::<ValidationMetrics>(row, 9)?,
    })
}

/// Next unused version for (owner, class_scope); versions start at 1
pub fn next_model_version(db: &DbConnection, owner: &str, class_scope: &ClassScope) -> DbResult<u32> {
    let conn = db.lock();
    let max: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM model_artifacts WHERE owner = ?1 AND class_scope = ?2",
        params![owner, class_scope.as_str()],
        |row| row.get(0),
    )?;
    Ok(max + 1)
}

/// Index a published artifact. Fails if the version already exists.
pub fn insert_artifact(db: &DbConnection, artifact: &ArtifactRecord) -> DbResult<()> {
    let metrics_json = serde_json::to_string(&artifact.metrics)
        .map_err(|e| conversion_error(9, e))?;

    let conn = db.lock();
    conn.execute(
        "INSERT INTO model_artifacts (id, owner, class_scope, version, path, metrics_path, sha256, bytes, created_at, metrics_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            artifact.id.to_string(),
            artifact.owner,
            artifact.class_scope.as_str(),
            artifact.version,
            artifact.path,
            artifact.metrics_path,
            artifact.sha256,
            artifact.bytes,
            format_time(&artifact.created_at),
            metrics_json,
        ],
    )?;

    Ok(())
}

pub fn get_artifact(
    db: &DbConnection,
    owner: &str,
    class_scope: &ClassScope,
    version: u32,
) -> DbResult<Option<ArtifactRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM model_artifacts WHERE owner = ?1 AND class_scope = ?2 AND version = ?3",
        ARTIFACT_COLUMNS
    ))?;
    Ok(stmt
        .query_row(params![owner, class_scope.as_str(), version], artifact_from_row)
        .optional()?)
}

/// All versions for (owner, class_scope), newest first
pub fn list_artifacts(
    db: &DbConnection,
    owner: &str,
    class_scope: &ClassScope,
) -> DbResult<Vec<ArtifactRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM model_artifacts WHERE owner = ?1 AND class_scope = ?2 ORDER BY version DESC",
        ARTIFACT_COLUMNS
    ))?;

    let artifacts = stmt
        .query_map(params![owner, class_scope.as_str()], artifact_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(artifacts)
}

// ==================== ACTIVE MODEL QUERIES ====================

/// Record the active version, replacing any previous one
pub fn set_active_version(
    db: &DbConnection,
    owner: &str,
    class_scope: &ClassScope,
    version: u32,
) -> DbResult<()> {
    let conn = db.lock();
    conn.execute(
        "INSERT INTO active_models (owner, class_scope, version, activated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(owner, class_scope) DO UPDATE SET
            version = excluded.version,
            activated_at = excluded.activated_at",
        params![owner, class_scope.as_str(), version, format_time(&Utc::now())],
    )?;
    Ok(())
}

pub fn get_active_version(
    db: &DbConnection,
    owner: &str,
    class_scope: &ClassScope,
) -> DbResult<Option<u32>> {
    let conn = db.lock();
    let version = conn
        .query_row(
            "SELECT version FROM active_models WHERE owner = ?1 AND class_scope = ?2",
            params![owner, class_scope.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Active versions for every scope of an owner
pub fn list_active(db: &DbConnection, owner: &str) -> DbResult<Vec<ActiveModelRecord>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT owner, class_scope, version, activated_at FROM active_models
         WHERE owner = ?1 ORDER BY class_scope",
    )?;

    let active = stmt
        .query_map([owner], |row| {
            Ok(ActiveModelRecord {
                owner: row.get(0)?,
                class_scope: ClassScope::new(row.get::<_, String>(1)?),
                version: row.get(2)?,
                activated_at: get_time(row, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(owner: &str, label: &str) -> SampleRecord {
        SampleRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            label: label.to_string(),
            path: format!("/tmp/{}.wav", label),
            sha256: "00".to_string(),
            sample_rate: 16000,
            num_samples: 32000,
            created_at: Utc::now(),
            metadata: SampleMetadata::default(),
        }
    }

    fn artifact(owner: &str, scope: &str, version: u32) -> ArtifactRecord {
        ArtifactRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            class_scope: ClassScope::new(scope),
            version,
            path: format!("/tmp/{}.json", version),
            metrics_path: None,
            sha256: "ff".to_string(),
            bytes: 10,
            created_at: Utc::now(),
            metrics: ValidationMetrics {
                accuracy: 0.9,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_sample_round_trip() {
        let db = DbConnection::open_in_memory().unwrap();
        let record = sample("alice", "positive");
        insert_sample(&db, &record).unwrap();

        let loaded = get_sample(&db, &record.id).unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.num_samples, 32000);
        assert_eq!(loaded.duration_secs(), 2.0);

        assert!(get_sample(&db, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_list_samples_filters() {
        let db = DbConnection::open_in_memory().unwrap();
        insert_sample(&db, &sample("alice", "positive")).unwrap();
        insert_sample(&db, &sample("alice", "negative")).unwrap();
        insert_sample(&db, &sample("alice", "negative")).unwrap();
        insert_sample(&db, &sample("bob", "positive")).unwrap();

        assert_eq!(list_samples(&db, "alice", None).unwrap().len(), 3);
        assert_eq!(list_samples(&db, "alice", Some("negative")).unwrap().len(), 2);
        assert_eq!(
            count_samples_by_label(&db, "alice").unwrap(),
            vec![("negative".to_string(), 2), ("positive".to_string(), 1)]
        );
    }

    #[test]
    fn test_versions_increase_and_are_unique() {
        let db = DbConnection::open_in_memory().unwrap();
        let scope = ClassScope::hotword();
        assert_eq!(next_model_version(&db, "alice", &scope).unwrap(), 1);

        insert_artifact(&db, &artifact("alice", "hotword", 1)).unwrap();
        insert_artifact(&db, &artifact("alice", "hotword", 2)).unwrap();
        assert_eq!(next_model_version(&db, "alice", &scope).unwrap(), 3);
        assert_eq!(next_model_version(&db, "bob", &scope).unwrap(), 1);

        assert!(insert_artifact(&db, &artifact("alice", "hotword", 2)).is_err());

        let versions: Vec<u32> = list_artifacts(&db, "alice", &scope)
            .unwrap()
            .iter()
            .map(|a| a.version)
            .collect();
        assert_eq!(versions, vec![2, 1]);

        let loaded = get_artifact(&db, "alice", &scope, 1).unwrap().unwrap();
        assert_eq!(loaded.metrics.accuracy, 0.9);
    }

    #[test]
    fn test_single_active_version() {
        let db = DbConnection::open_in_memory().unwrap();
        let scope = ClassScope::hotword();
        assert_eq!(get_active_version(&db, "alice", &scope).unwrap(), None);

        set_active_version(&db, "alice", &scope, 1).unwrap();
        set_active_version(&db, "alice", &scope, 2).unwrap();
        set_active_version(&db, "alice", &scope, 2).unwrap();

        assert_eq!(get_active_version(&db, "alice", &scope).unwrap(), Some(2));
        assert_eq!(list_active(&db, "alice").unwrap().len(), 1);
    }
}
