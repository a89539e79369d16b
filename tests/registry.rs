// Model registry integration tests
// Versioning, activation, rollback and recovery from corrupt artifacts across restarts

use tempfile::TempDir;

use aura_detect::audio::FeatureVector;
use aura_detect::detection::{LoadError, ModelWeights, ValidationMetrics};
use aura_detect::state::RegistryError;
use aura_detect::{ClassScope, Detector, DetectorError};

mod common;
use common::*;

fn weights(bias: f32) -> ModelWeights {
    ModelWeights {
        bias,
        ..ModelWeights::baseline()
    }
}

fn publish(detector: &Detector, owner: &str, bias: f32) -> u32 {
    detector
        .registry()
        .publish(owner, &ClassScope::hotword(), &weights(bias), &ValidationMetrics::default())
        .unwrap()
        .version
}

#[test]
fn test_versions_increase_and_newest_serves() {
    let dir = TempDir::new().unwrap();
    let detector = open_detector(&dir, test_config(), Vec::new());
    let scope = ClassScope::hotword();

    assert_eq!(publish(&detector, OWNER, -6.0), 1);
    assert_eq!(publish(&detector, OWNER, -5.0), 2);

    let versions: Vec<u32> = detector
        .list_model_versions(OWNER, &scope)
        .unwrap()
        .iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec![2, 1]);

    // Publishing alone does not swap the serving model
    assert_eq!(detector.engine().active(&scope).unwrap().version, 0);
}

#[test]
fn test_activation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let detector = open_detector(&dir, test_config(), Vec::new());
    let scope = ClassScope::hotword();
    publish(&detector, OWNER, -6.0);

    let first = detector.activate_model_version(OWNER, &scope, 1).unwrap();
    let second = detector.activate_model_version(OWNER, &scope, 1).unwrap();

    assert_eq!(first, second);
    assert_eq!(detector.list_model_versions(OWNER, &scope).unwrap().len(), 1);
    assert_eq!(detector.store().active_version(OWNER, &scope).unwrap(), Some(1));
}

#[test]
fn test_rollback_swaps_predictions() {
    let dir = TempDir::new().unwrap();
    let detector = open_detector(&dir, test_config(), Vec::new());
    let scope = ClassScope::hotword();
    publish(&detector, OWNER, -6.0);
    publish(&detector, OWNER, 6.0);

    let features = FeatureVector::zero();

    detector.activate_model_version(OWNER, &scope, 2).unwrap();
    let score = &detector.engine().predict(&features, 0.0)[0];
    assert_eq!(score.model_version, 2);
    assert!(score.probability > 0.5);

    detector.activate_model_version(OWNER, &scope, 1).unwrap();
    let score = &detector.engine().predict(&features, 0.0)[0];
    assert_eq!(score.model_version, 1);
    assert!(score.probability < 0.5);

    detector.activate_model_version(OWNER, &scope, 0).unwrap();
    assert!(detector.get_active_model_info(OWNER, &scope).unwrap().is_baseline);
}

#[test]
fn test_unknown_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let detector = open_detector(&dir, test_config(), Vec::new());

    let result = detector.activate_model_version(OWNER, &ClassScope::hotword(), 7);
    assert!(matches!(
        result,
        Err(DetectorError::Registry(RegistryError::UnknownVersion { version: 7, .. }))
    ));
    assert_eq!(detector.engine().active(&ClassScope::hotword()).unwrap().version, 0);
}

#[test]
fn test_other_owner_does_not_touch_serving_model() {
    let dir = TempDir::new().unwrap();
    let detector = open_detector(&dir, test_config(), Vec::new());
    let scope = ClassScope::hotword();

    publish(&detector, "bob", 2.0);
    detector.activate_model_version("bob", &scope, 1).unwrap();

    assert_eq!(detector.engine().active(&scope).unwrap().owner, OWNER);
    assert_eq!(detector.engine().active(&scope).unwrap().version, 0);
    assert_eq!(detector.get_active_model_info("bob", &scope).unwrap().version, 1);
}

#[test]
fn test_corrupt_active_artifact_falls_back_on_restart() {
    let dir = TempDir::new().unwrap();
    let scope = ClassScope::hotword();

    let corrupt_path = {
        let detector = open_detector(&dir, test_config(), Vec::new());
        publish(&detector, OWNER, -6.0);
        publish(&detector, OWNER, -5.0);
        detector.activate_model_version(OWNER, &scope, 2).unwrap();
        detector.list_model_versions(OWNER, &scope).unwrap()[0].path.clone()
    };
    std::fs::write(&corrupt_path, b"{ \"not\": \"a model\" }").unwrap();

    let detector = open_detector(&dir, test_config(), Vec::new());

    let active = detector.get_active_model_info(OWNER, &scope).unwrap();
    assert_eq!(active.version, 1);
    assert_eq!(detector.engine().active(&scope).unwrap().version, 1);
    assert_eq!(detector.store().active_version(OWNER, &scope).unwrap(), Some(1));

    let errors = detector.recent_load_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].version, 2);
    assert!(matches!(errors[0].error, LoadError::ChecksumMismatch { .. }));
}

#[test]
fn test_missing_artifacts_fall_back_to_baseline() {
    let dir = TempDir::new().unwrap();
    let scope = ClassScope::hotword();

    let path = {
        let detector = open_detector(&dir, test_config(), Vec::new());
        publish(&detector, OWNER, -6.0);
        detector.activate_model_version(OWNER, &scope, 1).unwrap();
        detector.list_model_versions(OWNER, &scope).unwrap()[0].path.clone()
    };
    std::fs::remove_file(&path).unwrap();

    let detector = open_detector(&dir, test_config(), Vec::new());
    let active = detector.get_active_model_info(OWNER, &scope).unwrap();
    assert!(active.is_baseline);
    assert!(matches!(detector.recent_load_errors()[0].error, LoadError::Missing(_)));
}
