//! Engine behavior with a model-backed classifier behind a mock server

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use memkeep::classifier::{Classifier, ClassifierChain, RemoteClassifier};
use memkeep::config::ClassifierConfig;
use memkeep::engine::MemoryEngine;
use memkeep::memory::records::{RelationType, WarningKind};
use memkeep::memory::types::{Gate, SaveRequest, Scope, Sensitivity};
use memkeep::testing::{InMemoryVectorIndex, engine_with, test_config};

fn classifier_config(server: &MockServer) -> ClassifierConfig {
    ClassifierConfig {
        api_url: format!("{}/v1/chat/completions", server.uri()),
        api_key_env: "MEMKEEP_TEST_UNSET_KEY".to_string(),
        model: "gpt-4o-mini".to_string(),
        timeout_secs: 5,
        max_retries: 0,
    }
}

fn engine_for(server: &MockServer, dir: &TempDir) -> MemoryEngine {
    let config = classifier_config(server);
    let remote: Arc<dyn Classifier> =
        Arc::new(RemoteClassifier::with_api_key(&config, "test-key").unwrap());
    engine_with(
        test_config(dir),
        ClassifierChain::new(Some(remote), Duration::from_secs(5)),
        Arc::new(InMemoryVectorIndex::new()),
    )
}

fn completion(content: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "content": content } }] })
}

#[tokio::test]
async fn test_model_verdicts_are_used() {
    let server = MockServer::start().await;
    // one reply serves both the gate and the sensitivity prompt
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"gate": "relational", "confidence": 88, "level": "safe", "reason": "work context"}"#,
        )))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = engine_for(&server, &dir);
    let outcome = engine
        .save(SaveRequest::new("Bob reviews every pull request on the team"))
        .await
        .unwrap();

    assert_eq!(outcome.memory.gate, Gate::Relational);
    assert_eq!(outcome.memory.confidence, 88.0);
    assert_eq!(outcome.memory.sensitivity, Sensitivity::Safe);
    assert!(
        outcome
            .warnings
            .iter()
            .all(|w| w.kind != WarningKind::ClassificationDegraded)
    );
}

#[tokio::test]
async fn test_model_cannot_absorb_a_correction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"gate": "epistemic", "confidence": 70, "level": "safe", "reason": "config detail"}"#,
        )))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = engine_for(&server, &dir);
    let old = engine
        .save(SaveRequest::new("the service reads db_url from the environment"))
        .await
        .unwrap()
        .memory;
    assert_eq!(old.gate, Gate::Epistemic);
    assert_eq!(old.confidence, 70.0);

    let correction = engine
        .save(SaveRequest::new("the config key is database_url, not db_url"))
        .await
        .unwrap();
    assert_eq!(correction.memory.gate, Gate::Correction);
    assert_eq!(correction.memory.scope, Scope::Global);
    assert!(correction.memory.confidence >= 90.0);

    let links = correction.links.expect("correction was linked");
    assert!(
        links
            .edges
            .iter()
            .any(|e| e.relation == RelationType::Contradicts && e.to_id == old.id)
    );
    let penalized = engine.store().get_memory(old.id).unwrap().unwrap();
    assert!(penalized.confidence < old.confidence);
}

#[tokio::test]
async fn test_outage_falls_back_to_heuristics() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = engine_for(&server, &dir);
    let outcome = engine
        .save(SaveRequest::new("user prefers dark mode"))
        .await
        .unwrap();

    assert_eq!(outcome.memory.gate, Gate::Behavioral);
    assert_eq!(outcome.memory.sensitivity, Sensitivity::Unclassified);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::ClassificationDegraded)
    );

    // a later batch with the model back classifies the leftover
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"level": "safe", "reason": "harmless preference"}"#,
        )))
        .mount(&server)
        .await;

    let report = engine.classify_sensitivity(false).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.safe, 1);
    let stored = engine.get(outcome.memory.id).await.unwrap();
    assert_eq!(stored.sensitivity, Sensitivity::Safe);
}

#[tokio::test]
async fn test_transcript_extraction_saves_candidates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Transcript:"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"memories": [{"content": "Dana leads the infra team", "gate": "relational", "person": "Dana"}, {"content": "user prefers dark mode", "gate": "behavioral"}]}"#,
        )))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"gate": "epistemic", "confidence": 70, "level": "safe", "reason": "harmless"}"#,
        )))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = engine_for(&server, &dir);
    let report = engine
        .auto_extract("user: Dana runs infra now. Also, dark mode please.")
        .await
        .unwrap();

    assert_eq!(report.candidates, 2);
    assert_eq!(report.saved.len(), 2);
    assert!(report.skipped.is_empty());
    assert_eq!(report.saved[0].memory.gate, Gate::Relational);
    assert_eq!(report.saved[0].memory.person.as_deref(), Some("Dana"));
    assert_eq!(report.saved[1].memory.gate, Gate::Behavioral);
    assert_eq!(report.saved[1].memory.sensitivity, Sensitivity::Safe);
}

#[tokio::test]
async fn test_extraction_outage_is_degraded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = engine_for(&server, &dir);
    let err = engine.auto_extract("user: hello").await.unwrap_err();
    assert_eq!(err.kind(), "classification_degraded");
}
