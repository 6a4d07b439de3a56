//! JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chimp_orchestrator::OrchestrationError;
use serde_json::json;
use tracing::{error, warn};

/// An error returned by a handler, rendered as
/// `{"status-code": 404, "error": "Not Found", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

/// HTTP status for each orchestration failure.
pub fn status_for(err: &OrchestrationError) -> StatusCode {
    match err {
        OrchestrationError::UnknownPlugin(_)
        | OrchestrationError::UnknownRun(_)
        | OrchestrationError::ModelNotFound { .. }
        | OrchestrationError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::InvalidSubmission { .. }
        | OrchestrationError::InvalidDescriptor { .. }
        | OrchestrationError::InvalidLabel { .. }
        | OrchestrationError::DuplicateSample { .. }
        | OrchestrationError::InvalidSample { .. }
        | OrchestrationError::EmptySession(_) => StatusCode::BAD_REQUEST,
        OrchestrationError::InvalidStageTransition { .. }
        | OrchestrationError::DuplicatePlugin(_) => StatusCode::CONFLICT,
        OrchestrationError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestrationError::PluginExecution(_)
        | OrchestrationError::Training(_)
        | OrchestrationError::Io(_)
        | OrchestrationError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(error = %err, "Request failed");
        } else {
            warn!(error = %err, "Request rejected");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status-code": self.status.as_u16(),
            "error": self.status.canonical_reason().unwrap_or("Unknown Error"),
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chimp_orchestrator::ModelStage;

    #[test]
    fn test_status_mapping() {
        let unknown = OrchestrationError::UnknownPlugin("x".into());
        assert_eq!(status_for(&unknown), StatusCode::NOT_FOUND);
        let empty = OrchestrationError::EmptySession("s".into());
        assert_eq!(status_for(&empty), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&OrchestrationError::InvalidStageTransition {
                from: ModelStage::None,
                to: ModelStage::Production
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&OrchestrationError::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_conversion_keeps_message() {
        let err: ApiError = OrchestrationError::UnknownRun("r-1".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(err.message.contains("r-1"));
    }
}
