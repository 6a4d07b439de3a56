//! HTTP API tests against in-memory services.

mod common;

use axum::http::{Method, StatusCode};
use base64::{engine::general_purpose, Engine as _};
use common::{app, drive_to_terminal, memory_services, send, send_bytes, tar_gz};
use serde_json::{json, Value};

#[tokio::test]
async fn test_ping() {
    let services = memory_services();
    let app = app(&services);
    let (status, _) = send(&app, Method::GET, "/ping", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_list_plugins() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) = send(&app, Method::GET, "/plugins", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "successfully retrieved plugins");
    assert_eq!(body["plugins"], json!(["emotion_recognition", "example"]));

    let (_, body) = send(&app, Method::GET, "/plugins?include_details", None).await;
    let plugins = body["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 2);
    assert_eq!(plugins[0]["name"], "emotion_recognition");
    assert!(plugins[0]["arguments"]["user_id"]["optional"].as_bool().unwrap());
    assert_eq!(plugins[0]["categories"].as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn test_submit_and_poll() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) = send(
        &app,
        Method::POST,
        "/tasks/run/example",
        Some(json!({ "args": { "message": "hello" } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, &format!("/tasks/poll/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["plugin_name"], "example");

    let run = drive_to_terminal(&services.dispatcher, &run_id).await;
    assert_eq!(run.tags["message"], "hello");

    let (_, body) = send(&app, Method::GET, &format!("/tasks/poll/{run_id}"), None).await;
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["metrics"]["ok"], 1.0);

    let (_, body) = send(&app, Method::GET, "/tasks?status=succeeded", None).await;
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);

    let (_, body) = send(&app, Method::GET, "/metrics/runs", None).await;
    assert_eq!(body["progress"]["queued"], 1);
    assert_eq!(body["progress"]["succeeded"], 1);
    assert_eq!(body["queue"]["pending"], 0);
}

#[tokio::test]
async fn test_submit_without_body_uses_empty_args() {
    let services = memory_services();
    let app = app(&services);
    let (status, _) = send(&app, Method::POST, "/tasks/run/example", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_malformed_submit_body_is_rejected() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) = send(
        &app,
        Method::POST,
        "/tasks/run/example",
        Some(json!({ "args": { "message": 42 }, "datasets": "oops" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status-code"], 400);
    assert_eq!(body["error"], "Bad Request");
    assert!(body["message"].as_str().unwrap().contains("invalid JSON body"));

    let (status, body) = send(&app, Method::POST, "/tasks/run/example", Some(json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status-code"], 400);

    let (_, body) = send(&app, Method::GET, "/tasks", None).await;
    assert!(body["runs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_json_rejections_keep_error_shape() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) = send(
        &app,
        Method::POST,
        "/calibration/s1/upload",
        Some(json!({ "samples": "not a list" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status-code"], 400);
    assert!(body["message"].is_string());

    let (status, body) = send(
        &app,
        Method::POST,
        "/models/emotion_recognition/emotion_model/versions/1/stage",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Bad Request");
}

#[tokio::test]
async fn test_error_responses() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) =
        send(&app, Method::POST, "/tasks/run/no+such+plugin", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status-code"], 404);
    assert_eq!(body["error"], "Not Found");
    assert!(body["message"].as_str().unwrap().contains("no such plugin"));

    let (status, body) = send(&app, Method::GET, "/tasks/poll/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status-code"], 404);

    let (status, body) = send(&app, Method::GET, "/tasks?status=sideways", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Bad Request");
}

fn sample(emotion: &str, timestamp: &str) -> Value {
    json!({
        "username": "alice",
        "blob": general_purpose::STANDARD.encode([0x89, b'P', b'N', b'G']),
        "emotion": emotion,
        "timestamp": timestamp,
    })
}

#[tokio::test]
async fn test_calibration_flow() {
    let services = memory_services();
    let app = app(&services);

    let (status, body) = send(
        &app,
        Method::POST,
        "/calibration/s1/upload",
        Some(json!({ "samples": [sample("happy", "t1"), sample("sad", "t2")] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["buffered"], 2);
    assert_eq!(body["labels"]["happy"], 1);

    let (status, body) = send(
        &app,
        Method::POST,
        "/calibration/s1/upload",
        Some(json!({ "samples": [sample("bored", "t3")] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("bored"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/calibration/s1/upload",
        Some(json!({ "samples": [sample("happy", "t1")] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::POST, "/calibration/s1/flush?train=", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_str().unwrap().to_string();
    assert_eq!(body["receipt"]["samples"], 2);
    assert!(body["receipt"]["key"].as_str().unwrap().starts_with("calibration/alice/"));

    let run = drive_to_terminal(&services.dispatcher, &run_id).await;
    assert_eq!(run.experiment_name.as_deref(), Some("emotion_recognition_calib_alice"));
    assert_eq!(run.metrics["samples"], 2.0);
    assert_eq!(run.model_version, Some(1));

    let (status, body) = send(&app, Method::POST, "/calibration/s1/flush", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status-code"], 400);
}

#[tokio::test]
async fn test_calibration_rejects_bad_base64_and_discards() {
    let services = memory_services();
    let app = app(&services);

    let bad = json!({
        "samples": [{ "username": "bob", "blob": "%%%", "emotion": "happy", "timestamp": "t1" }]
    });
    let (status, _) = send(&app, Method::POST, "/calibration/s2/upload", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(services.calibration.sample_count("s2").await, 0);

    let upload = json!({ "samples": [sample("fear", "t1")] });
    send(&app, Method::POST, "/calibration/s2/upload", Some(upload)).await;
    let (status, body) = send(&app, Method::DELETE, "/calibration/s2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["discarded"], 1);
    assert_eq!(services.calibration.sample_count("s2").await, 0);
}

#[tokio::test]
async fn test_dataset_upload_and_training() {
    let services = memory_services();
    let app = app(&services);

    let archive = tar_gz(&[
        ("train/happy/1.png", b"a"),
        ("train/happy/2.png", b"b"),
        ("train/sad/1.png", b"c"),
    ]);
    let (status, body) = send_bytes(&app, "/datasets/faces", archive).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["prefix"], "datasets/faces/");
    assert_eq!(body["files"], 3);

    let (status, _) = send_bytes(&app, "/datasets/bad-name", tar_gz(&[("a", b"a")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, Method::GET, "/datasets", None).await;
    assert_eq!(body["datasets"], json!(["faces"]));

    let (_, body) = send(
        &app,
        Method::POST,
        "/tasks/run/emotion_recognition",
        Some(json!({ "args": { "epochs": "3" }, "datasets": { "emotions": "datasets/faces/" } })),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();
    let run = drive_to_terminal(&services.dispatcher, &run_id).await;
    assert_eq!(run.metrics["samples"], 3.0);
    assert_eq!(run.experiment_name.as_deref(), Some("emotion_recognition"));
}

#[tokio::test]
async fn test_model_promotion_endpoints() {
    let services = memory_services();
    let app = app(&services);

    send_bytes(&app, "/datasets/faces", tar_gz(&[("train/angry/1.png", b"a")])).await;
    for _ in 0..2 {
        let (_, body) = send(
            &app,
            Method::POST,
            "/tasks/run/emotion_recognition",
            Some(json!({ "datasets": { "emotions": "datasets/faces" } })),
        )
        .await;
        drive_to_terminal(&services.dispatcher, body["run_id"].as_str().unwrap()).await;
    }

    let base = "/models/emotion_recognition/emotion_model";
    let (_, body) = send(&app, Method::GET, &format!("{base}/versions"), None).await;
    assert_eq!(body["versions"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::GET, &format!("{base}/production"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("{base}/versions/1/stage"),
        Some(json!({ "stage": "production" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status-code"], 409);

    for (version, stage) in [(1, "staging"), (1, "production"), (2, "staging"), (2, "production")] {
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("{base}/versions/{version}/stage"),
            Some(json!({ "stage": stage })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&app, Method::GET, &format!("{base}/production"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);

    let (_, body) =
        send(&app, Method::GET, &format!("{base}/production?stage=staging"), None).await;
    assert_eq!(body["version"], 1);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{base}/versions/9/stage"),
        Some(json!({ "stage": "staging" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{base}/versions/1/stage"),
        Some(json!({ "stage": "gold" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resolve_prefers_calibrated_model() {
    let services = memory_services();
    let app = app(&services);

    send_bytes(&app, "/datasets/faces", tar_gz(&[("train/happy/1.png", b"a")])).await;
    let (_, body) = send(
        &app,
        Method::POST,
        "/tasks/run/emotion_recognition",
        Some(json!({ "datasets": { "emotions": "datasets/faces" } })),
    )
    .await;
    drive_to_terminal(&services.dispatcher, body["run_id"].as_str().unwrap()).await;
    let base = "/models/emotion_recognition/emotion_model";
    for stage in ["staging", "production"] {
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("{base}/versions/1/stage"),
            Some(json!({ "stage": stage })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    send(
        &app,
        Method::POST,
        "/calibration/s1/upload",
        Some(json!({ "samples": [sample("happy", "t1"), sample("sad", "t2")] })),
    )
    .await;
    let (_, body) = send(&app, Method::POST, "/calibration/s1/flush?train=", None).await;
    let calibration_run = body["run_id"].as_str().unwrap().to_string();
    drive_to_terminal(&services.dispatcher, &calibration_run).await;

    let (status, body) =
        send(&app, Method::GET, &format!("{base}/production?user=alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["calibrated"], true);
    assert_eq!(body["experiment_name"], "emotion_recognition_calib_alice");

    let (_, body) = send(
        &app,
        Method::GET,
        &format!("{base}/production?run_id={calibration_run}"),
        None,
    )
    .await;
    assert_eq!(body["calibrated"], true);
    assert_eq!(body["experiment_name"], "emotion_recognition_calib_alice");

    let (status, body) =
        send(&app, Method::GET, &format!("{base}/production?user=bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["calibrated"], false);
    assert_eq!(body["experiment_name"], "emotion_recognition");
    assert_eq!(body["stage"], "production");
}
