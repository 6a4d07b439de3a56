//! HTTP API.
//!
//! Routes:
//! - `GET  /ping`
//! - `GET  /plugins[?include_details]`
//! - `POST /tasks/run/:plugin_name`, `GET /tasks/poll/:run_id`, `GET /tasks`
//! - `GET  /metrics/runs`
//! - `POST /calibration/:session_id/upload`, `POST /calibration/:session_id/flush`,
//!   `DELETE /calibration/:session_id`
//! - `GET  /datasets`, `POST /datasets/:name`
//! - `GET  /models/:experiment/:model/versions`,
//!   `GET  /models/:experiment/:model/production[?stage][&user|&run_id]`,
//!   `POST /models/:experiment/:model/versions/:version/stage`
//!
//! Errors, including malformed request bodies, are JSON bodies of the form
//! `{"status-code": 400, "error": "Bad Request", "message": "..."}`.

pub mod error;
pub mod extract;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{ChimpError, Result};
use crate::services::ChimpServices;

pub use error::{ApiError, ApiResult};

pub type AppState = Arc<ChimpServices>;

/// Dataset archives can be large.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/plugins", get(handlers::list_plugins))
        .route("/tasks", get(handlers::list_runs))
        .route("/tasks/run/:plugin_name", post(handlers::submit_run))
        .route("/tasks/poll/:run_id", get(handlers::poll_run))
        .route("/metrics/runs", get(handlers::run_metrics))
        .route("/calibration/:session_id", delete(handlers::discard_calibration))
        .route("/calibration/:session_id/upload", post(handlers::upload_calibration))
        .route("/calibration/:session_id/flush", post(handlers::flush_calibration))
        .route("/datasets", get(handlers::list_datasets))
        .route("/datasets/:name", post(handlers::upload_dataset))
        .route("/models/:experiment/:model/versions", get(handlers::list_model_versions))
        .route("/models/:experiment/:model/production", get(handlers::resolve_model))
        .route(
            "/models/:experiment/:model/versions/:version/stage",
            post(handlers::promote_model),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Serves the API until Ctrl-C, running the worker pool alongside when
/// `server.run_workers` is set.
///
/// # Errors
/// Returns an error if the address cannot be bound or serving fails.
pub async fn run(services: ChimpServices) -> Result<()> {
    let services = Arc::new(services);
    let address = services.config.server.address;

    let mut pool = services.config.server.run_workers.then(|| services.worker_pool());
    if let Some(pool) = pool.as_mut() {
        pool.start().map_err(ChimpError::Server)?;
    }

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %address, "CHIMP server listening");

    let served = axum::serve(listener, router(Arc::clone(&services)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(mut pool) = pool {
        pool.shutdown().await;
    }
    served.map_err(ChimpError::Io)
}
