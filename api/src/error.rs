use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::error::{self, ApiError};
use relay_gateway::dispatch::DispatchError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or rejected credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not allowed (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Resource does not exist (404)
    NotFound { resource: String },
    /// Dispatch protocol failure, mapped per error kind
    Dispatch(DispatchError),
    /// Workspace could not be resolved or provisioned (502)
    WorkspaceUnresolved { message: String },
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                    next_action: None,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                    next_action: None,
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                    next_action: None,
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    next_action: None,
                },
            ),
            AppError::Dispatch(err) => dispatch_error_response(err, request_id),
            AppError::WorkspaceUnresolved { message } => (
                StatusCode::BAD_GATEWAY,
                ApiError {
                    error: error::codes::WORKSPACE_UNRESOLVED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "The execution workspace could not be resolved or provisioned. \
                         Retry once the backend is reachable."
                            .to_string(),
                    ),
                    next_action: None,
                },
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                        next_action: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

/// Dispatch errors are protocol-level and expected under at-least-once
/// delivery; each maps to a structured, user-actionable response.
fn dispatch_error_response(err: DispatchError, request_id: String) -> (StatusCode, ApiError) {
    match err {
        DispatchError::UnknownExecution => (
            StatusCode::NOT_FOUND,
            ApiError {
                error: error::codes::NOT_FOUND.to_string(),
                message: "Unknown execution id".to_string(),
                field: Some("execution_id".to_string()),
                received: None,
                request_id,
                docs_hint: Some(
                    "The task may have passed its retention window. Poll /v1/dispatch/next for new work."
                        .to_string(),
                ),
                next_action: None,
            },
        ),
        DispatchError::LeaseNotHeld => (
            StatusCode::CONFLICT,
            ApiError {
                error: error::codes::LEASE_NOT_HELD.to_string(),
                message: "The lease is not held by this client".to_string(),
                field: Some("lease_id".to_string()),
                received: None,
                request_id,
                docs_hint: Some(
                    "The lease expired or was reclaimed. Reconcile via /v1/dispatch/inflight and \
                     re-reserve work via /v1/dispatch/next."
                        .to_string(),
                ),
                next_action: Some("list_inflight".to_string()),
            },
        ),
        DispatchError::LeaseCeilingExceeded { ceiling_secs } => (
            StatusCode::CONFLICT,
            ApiError {
                error: error::codes::LEASE_CEILING_EXCEEDED.to_string(),
                message: format!(
                    "Cumulative lease ceiling of {ceiling_secs}s exceeded; no further extensions"
                ),
                field: None,
                received: None,
                request_id,
                docs_hint: Some(
                    "Submit a terminal result now; the task cannot be heartbeated further."
                        .to_string(),
                ),
                next_action: Some("submit_result".to_string()),
            },
        ),
        DispatchError::InvalidPayload(inner) => (
            StatusCode::BAD_REQUEST,
            ApiError {
                error: error::codes::VALIDATION_FAILED.to_string(),
                message: inner.to_string(),
                field: None,
                received: None,
                request_id,
                docs_hint: None,
                next_action: None,
            },
        ),
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        AppError::Dispatch(err)
    }
}
