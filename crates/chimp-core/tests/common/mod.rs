//! Shared helpers for CHIMP Core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chimp_core::{router, ChimpConfig, ChimpServices, StorageBackend};
use chimp_orchestrator::{JobDispatcher, TrainingRun};
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Config with fast retries, rooted in `dir` when given.
pub fn test_config(dir: Option<&TempDir>) -> ChimpConfig {
    let mut config = ChimpConfig::default();
    config.dispatcher.backoff_base_ms = 5;
    config.dispatcher.backoff_max_ms = 20;
    config.dispatcher.poll_interval_ms = 5;
    match dir {
        Some(dir) => {
            config.storage.database_path = dir.path().join("chimp.db");
            config.storage.artifact_root = dir.path().join("artifacts");
            config.storage.scratch_root = Some(dir.path().join("scratch"));
        }
        None => config.storage.backend = StorageBackend::Memory,
    }
    config
}

pub fn memory_services() -> Arc<ChimpServices> {
    Arc::new(ChimpServices::from_config(test_config(None)).unwrap())
}

pub fn sqlite_services(dir: &TempDir) -> Arc<ChimpServices> {
    Arc::new(ChimpServices::from_config(test_config(Some(dir))).unwrap())
}

/// Sends one request through the router and decodes the JSON body
/// (`Value::Null` for empty or non-JSON bodies).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send_request(app, request).await
}

pub async fn send_bytes(app: &Router, uri: &str, bytes: Vec<u8>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/gzip")
        .body(Body::from(bytes))
        .unwrap();
    send_request(app, request).await
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

pub fn app(services: &Arc<ChimpServices>) -> Router {
    router(Arc::clone(services))
}

/// A `.tar.gz` holding `files`.
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Drives the dispatcher directly until the run is terminal.
pub async fn drive_to_terminal(dispatcher: &JobDispatcher, run_id: &str) -> TrainingRun {
    for _ in 0..200 {
        let run = dispatcher.poll(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        dispatcher.process_next("test-worker").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}
