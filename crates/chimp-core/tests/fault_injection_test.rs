//! Store failures surfacing through the service and the HTTP API.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use chimp_core::{builtin_plugins, router, ChimpServices};
use chimp_orchestrator::store::{
    InMemoryArtifactStore, InMemoryExperimentRegistry, InMemoryRunStore, InMemoryWorkQueue,
};
use chimp_orchestrator::{RunStatus, RunStore, Stores};
use chimp_training::CategorySet;
use common::{drive_to_terminal, send, test_config};
use serde_json::json;

struct Harness {
    services: Arc<ChimpServices>,
    runs: Arc<InMemoryRunStore>,
    queue: Arc<InMemoryWorkQueue>,
    artifacts: Arc<InMemoryArtifactStore>,
    experiments: Arc<InMemoryExperimentRegistry>,
}

fn harness() -> Harness {
    let runs = Arc::new(InMemoryRunStore::new());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let experiments = Arc::new(InMemoryExperimentRegistry::new());
    let stores = Stores {
        runs: runs.clone(),
        queue: queue.clone(),
        artifacts: artifacts.clone(),
        experiments: experiments.clone(),
    };
    let plugins = builtin_plugins(&CategorySet::default());
    let services = ChimpServices::assemble(test_config(None), stores, plugins);
    Harness { services: Arc::new(services), runs, queue, artifacts, experiments }
}

#[tokio::test]
async fn test_enqueue_failure_withdraws_run_and_returns_503() {
    let h = harness();
    let app = router(Arc::clone(&h.services));
    h.queue.faults().fail_next("enqueue", 1);

    let (status, body) = send(&app, Method::POST, "/tasks/run/example", Some(json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status-code"], 503);
    assert_eq!(body["error"], "Service Unavailable");
    assert!(h.runs.list(None, 10).await.unwrap().is_empty());

    let (status, _) = send(&app, Method::POST, "/tasks/run/example", Some(json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_transient_claim_failure_is_retried() {
    let h = harness();
    let run_id =
        h.services.dispatcher.submit("example", BTreeMap::new(), BTreeMap::new()).await.unwrap();
    h.runs.faults().fail_next("claim", 2);

    let run = drive_to_terminal(&h.services.dispatcher, &run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempts, 1);
}

#[tokio::test]
async fn test_artifact_outage_during_publish_requeues_run() {
    let h = harness();
    let run_id = h
        .services
        .dispatcher
        .submit(
            "emotion_recognition",
            BTreeMap::new(),
            BTreeMap::from([("emotions".to_string(), "datasets/faces/".to_string())]),
        )
        .await
        .unwrap();
    chimp_core::datasets::upload(
        h.artifacts.as_ref(),
        "faces",
        common::tar_gz(&[("train/happy/1.png", b"x")]),
    )
    .await
    .unwrap();
    h.artifacts.faults().fail_next("put", 1);

    let run = drive_to_terminal(&h.services.dispatcher, &run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempts, 2);
    assert_eq!(run.model_version, Some(1));
}

#[tokio::test]
async fn test_registry_outage_on_promotion_returns_503() {
    let h = harness();
    let app = router(Arc::clone(&h.services));
    h.experiments.faults().fail_next("list_versions", 1);

    let uri = "/models/emotion_recognition/emotion_model/versions";
    let (status, _) = send(&app, Method::GET, uri, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = send(&app, Method::GET, uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["versions"], json!([]));
}

#[tokio::test]
async fn test_missing_dataset_fails_run() {
    let h = harness();
    let run_id = h
        .services
        .dispatcher
        .submit(
            "emotion_recognition",
            BTreeMap::new(),
            BTreeMap::from([("emotions".to_string(), "datasets/nothing/".to_string())]),
        )
        .await
        .unwrap();
    let run = drive_to_terminal(&h.services.dispatcher, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("nothing"));
}
