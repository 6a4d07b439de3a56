//! Route handlers.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use chimp_orchestrator::{ModelStage, RunStatus, SampleUpload, StageChange, TrainingRun};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::error::{ApiError, ApiResult};
use super::extract::{ApiJson, OptionalJson};
use super::AppState;
use crate::datasets;
use crate::serving::{Calibration, ResolvedModel};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1000;

pub async fn ping() -> &'static str {
    "pong"
}

#[derive(Debug, Default, Deserialize)]
pub struct PluginsQuery {
    /// Present (with any value) to get full descriptors instead of names.
    pub include_details: Option<String>,
}

pub async fn list_plugins(
    State(state): State<AppState>,
    Query(query): Query<PluginsQuery>,
) -> Json<Value> {
    let registry = state.dispatcher.registry();
    let plugins = if query.include_details.is_some() {
        json!(registry.list())
    } else {
        json!(registry.names())
    };
    Json(json!({ "status": "successfully retrieved plugins", "plugins": plugins }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub datasets: BTreeMap<String, String>,
}

/// `+` in the path stands for a space, as in form-encoded names.
fn plugin_path_name(raw: &str) -> String {
    raw.replace('+', " ")
}

pub async fn submit_run(
    State(state): State<AppState>,
    Path(plugin_name): Path<String>,
    OptionalJson(request): OptionalJson<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let plugin_name = plugin_path_name(&plugin_name);
    let run_id = state.dispatcher.submit(&plugin_name, request.args, request.datasets).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "successfully started task", "run_id": run_id })),
    ))
}

pub async fn poll_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<TrainingRun>> {
    Ok(Json(state.dispatcher.poll(&run_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Value>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let runs = state.dispatcher.list_runs(status, limit).await?;
    Ok(Json(json!({ "runs": runs })))
}

pub async fn run_metrics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let progress = state.dispatcher.progress().snapshot().await;
    let queue = state.stores.queue.depth().await?;
    Ok(Json(json!({ "progress": progress, "queue": queue })))
}

#[derive(Debug, Deserialize)]
pub struct CalibrationSampleBody {
    #[serde(default)]
    pub username: String,
    /// Base64-encoded image bytes.
    pub blob: String,
    pub emotion: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct CalibrationUpload {
    pub samples: Vec<CalibrationSampleBody>,
}

pub async fn upload_calibration(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ApiJson(upload): ApiJson<CalibrationUpload>,
) -> ApiResult<Json<Value>> {
    let samples = upload
        .samples
        .into_iter()
        .enumerate()
        .map(|(i, sample)| {
            let blob = general_purpose::STANDARD.decode(sample.blob.as_bytes()).map_err(|e| {
                ApiError::bad_request(format!("sample {i}: blob is not valid base64: {e}"))
            })?;
            Ok(SampleUpload {
                user_id: sample.username,
                label: sample.emotion,
                blob,
                timestamp: sample.timestamp,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let accepted = samples.len();
    let buffered = state.calibration.add_samples(&session_id, samples).await?;
    debug!(session_id = %session_id, accepted, buffered, "Calibration samples buffered");
    Ok(Json(json!({
        "status": "samples accepted",
        "session_id": session_id,
        "accepted": accepted,
        "buffered": buffered,
        "labels": state.calibration.label_counts(&session_id).await,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct FlushQuery {
    /// Plugin to train on the flushed archive, defaulting to the configured one.
    pub train: Option<String>,
}

pub async fn flush_calibration(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<FlushQuery>,
) -> ApiResult<impl IntoResponse> {
    match query.train {
        None => {
            let receipt = state.calibration.flush(&session_id).await?;
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "session flushed", "receipt": receipt })),
            ))
        }
        Some(plugin) => {
            let plugin = if plugin.trim().is_empty() {
                state.config.calibration.plugin.clone()
            } else {
                plugin_path_name(&plugin)
            };
            let (receipt, run_id) = state
                .calibration
                .flush_and_submit(&session_id, &state.dispatcher, &plugin)
                .await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "session flushed", "receipt": receipt, "run_id": run_id })),
            ))
        }
    }
}

pub async fn discard_calibration(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let discarded = state.calibration.discard(&session_id).await;
    info!(session_id = %session_id, discarded, "Calibration session discarded");
    Json(json!({ "status": "session discarded", "discarded": discarded }))
}

pub async fn list_datasets(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let names = datasets::list(state.stores.artifacts.as_ref()).await?;
    Ok(Json(json!({ "datasets": names })))
}

pub async fn upload_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !datasets::is_valid_name(&name) {
        return Err(ApiError::bad_request(format!(
            "dataset name '{name}' must be alphanumeric"
        )));
    }
    let upload = datasets::upload(state.stores.artifacts.as_ref(), &name, body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

pub async fn list_model_versions(
    State(state): State<AppState>,
    Path((experiment, model)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let versions = state.promotion.list_versions(&experiment, &model).await?;
    Ok(Json(json!({ "versions": versions })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveQuery {
    pub stage: Option<String>,
    /// Prefer this user's calibrated model.
    pub user: Option<String>,
    /// Prefer the model registered by this calibration run.
    pub run_id: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_stage(raw: &str) -> ApiResult<ModelStage> {
    raw.parse::<ModelStage>().map_err(ApiError::bad_request)
}

pub async fn resolve_model(
    State(state): State<AppState>,
    Path((experiment, model)): Path<(String, String)>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ResolvedModel>> {
    let stage = query
        .stage
        .as_deref()
        .map(parse_stage)
        .transpose()?
        .unwrap_or(ModelStage::Production);
    let calibration = match (non_blank(query.run_id.as_deref()), non_blank(query.user.as_deref())) {
        (Some(run_id), _) => Some(Calibration::Run(run_id)),
        (None, Some(user)) => Some(Calibration::User(user)),
        (None, None) => None,
    };
    let resolved = match calibration {
        Some(calibration) => {
            state.resolver.resolve_calibrated(&experiment, &model, stage, calibration).await?
        }
        None => state.resolver.resolve(&experiment, &model, stage).await?,
    };
    let resolved = resolved.ok_or_else(|| {
        ApiError::not_found(format!("no {stage} version of {experiment}/{model}"))
    })?;
    Ok(Json(resolved))
}

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub stage: String,
}

pub async fn promote_model(
    State(state): State<AppState>,
    Path((experiment, model, version)): Path<(String, String, u32)>,
    ApiJson(request): ApiJson<StageRequest>,
) -> ApiResult<Json<StageChange>> {
    let target = parse_stage(&request.stage)?;
    Ok(Json(state.promotion.promote(&experiment, &model, version, target).await?))
}

