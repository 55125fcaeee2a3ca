use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use relay_core::dispatch::{Attachment, SubmitReceipt, TaskLease, TerminalStatus};
use relay_core::error::ApiError;
use relay_gateway::config::LEASE_SECONDS_DEFAULT;

use crate::auth::AuthenticatedClient;
use crate::error::AppError;
use crate::state::AppState;

const QUEUE_TOKEN_HEADER: &str = "x-relay-queue-token";

pub fn worker_router() -> Router<AppState> {
    Router::new()
        .route("/v1/dispatch/next", post(next_tasks))
        .route("/v1/dispatch/ack", post(ack_task))
        .route("/v1/dispatch/progress", post(progress_task))
        .route("/v1/dispatch/result", post(submit_result))
        .route("/v1/dispatch/inflight", get(list_inflight))
}

pub fn enqueue_router() -> Router<AppState> {
    Router::new().route("/v1/dispatch/enqueue", post(enqueue_task))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct NextTasksRequest {
    /// Max tasks to reserve (1..=10, default 1)
    #[serde(default)]
    pub limit: Option<usize>,
    /// Initial lease window in seconds (5..=120, default 30)
    #[serde(default)]
    pub lease_seconds: Option<u64>,
    /// Long-poll up to this many seconds when no work is pending (0..=30)
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskLease>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct AckRequest {
    pub execution_id: Uuid,
    pub lease_id: Uuid,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ProgressRequest {
    pub execution_id: Uuid,
    pub lease_id: Uuid,
    #[serde(default)]
    pub pct: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitResultRequest {
    pub execution_id: Uuid,
    pub lease_id: Uuid,
    pub status: TerminalStatus,
    /// Bounded human-readable summary of the outcome
    pub output: String,
    #[serde(default)]
    pub result_json: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Optional echo of the caller's client id; must match the
    /// authenticated identity when present
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct EnqueueRequest {
    pub workspace_id: Uuid,
    /// Canonical capability identifier (`pack.action`)
    pub capability: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EnqueueResponse {
    pub execution_id: Uuid,
    pub status: String,
}

/// Reserve pending tasks for this worker, long-polling up to
/// `wait_seconds`. Each reserved task carries a fresh lease that must be
/// acknowledged before it expires.
#[utoipa::path(
    post,
    path = "/v1/dispatch/next",
    request_body = NextTasksRequest,
    responses(
        (status = 200, description = "Reserved tasks (possibly empty)", body = TaskListResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 502, description = "Workspace unresolved", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "dispatch"
)]
pub async fn next_tasks(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Json(req): Json<NextTasksRequest>,
) -> Result<Json<TaskListResponse>, AppError> {
    let workspace_id = resolve_workspace(&state, &client).await?;
    let tasks = state
        .gateway
        .dispatcher()
        .next(
            workspace_id,
            &client.client_id,
            req.limit.unwrap_or(1),
            req.lease_seconds.unwrap_or(LEASE_SECONDS_DEFAULT),
            req.wait_seconds.unwrap_or(0),
        )
        .await;
    Ok(Json(TaskListResponse { tasks }))
}

/// Acknowledge a reservation, extending the lease to the working window.
#[utoipa::path(
    post,
    path = "/v1/dispatch/ack",
    request_body = AckRequest,
    responses(
        (status = 200, description = "Lease extended", body = TaskLease),
        (status = 404, description = "Unknown execution", body = ApiError),
        (status = 409, description = "Lease not held", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "dispatch"
)]
pub async fn ack_task(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Json(req): Json<AckRequest>,
) -> Result<Json<TaskLease>, AppError> {
    let lease = state
        .gateway
        .dispatcher()
        .ack(req.execution_id, req.lease_id, &client.client_id)?;
    Ok(Json(lease))
}

/// Heartbeat: report progress and reset the lease timer. Rejected once
/// the cumulative lease ceiling is reached.
#[utoipa::path(
    post,
    path = "/v1/dispatch/progress",
    request_body = ProgressRequest,
    responses(
        (status = 200, description = "Lease refreshed", body = TaskLease),
        (status = 404, description = "Unknown execution", body = ApiError),
        (status = 409, description = "Lease not held or ceiling exceeded", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "dispatch"
)]
pub async fn progress_task(
    State(state): State<AppState>,
    _client: AuthenticatedClient,
    Json(req): Json<ProgressRequest>,
) -> Result<Json<TaskLease>, AppError> {
    let lease = state
        .gateway
        .dispatcher()
        .progress(req.execution_id, req.lease_id, req.pct, req.message)?;
    Ok(Json(lease))
}

/// Submit the terminal result of a task. Idempotent: a retried submission
/// returns the originally recorded outcome with `replayed: true`.
#[utoipa::path(
    post,
    path = "/v1/dispatch/result",
    request_body = SubmitResultRequest,
    responses(
        (status = 200, description = "Outcome recorded (or replayed)", body = SubmitReceipt),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 404, description = "Unknown execution", body = ApiError),
        (status = 409, description = "Lease not held", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "dispatch"
)]
pub async fn submit_result(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Json(req): Json<SubmitResultRequest>,
) -> Result<Json<SubmitReceipt>, AppError> {
    if let Some(declared) = &req.client_id {
        if declared != &client.client_id {
            return Err(AppError::Validation {
                message: "client_id does not match the authenticated caller".to_string(),
                field: Some("client_id".to_string()),
                received: Some(json!(declared)),
                docs_hint: Some(
                    "Omit client_id or pass the fingerprint issued to this credential."
                        .to_string(),
                ),
            });
        }
    }
    let receipt = state.gateway.dispatcher().submit_result(
        req.execution_id,
        req.lease_id,
        req.status,
        req.output,
        req.result_json,
        req.attachments,
        &client.client_id,
    )?;
    Ok(Json(receipt))
}

/// All non-terminal tasks currently leased to this worker — the resume
/// path after a restart.
#[utoipa::path(
    get,
    path = "/v1/dispatch/inflight",
    responses(
        (status = 200, description = "Inflight tasks", body = TaskListResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "dispatch"
)]
pub async fn list_inflight(
    State(state): State<AppState>,
    client: AuthenticatedClient,
) -> Result<Json<TaskListResponse>, AppError> {
    let tasks = state.gateway.dispatcher().list_inflight(&client.client_id);
    Ok(Json(TaskListResponse { tasks }))
}

/// Backend-facing enqueue, guarded by the shared service token.
#[utoipa::path(
    post,
    path = "/v1/dispatch/enqueue",
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Task enqueued", body = EnqueueResponse),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 403, description = "Queue token missing or invalid", body = ApiError)
    ),
    tag = "dispatch"
)]
pub async fn enqueue_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let supplied = headers
        .get(QUEUE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    state.auth.check_queue_token(supplied)?;

    let capability = req.capability.trim();
    if capability.is_empty() || !capability.contains('.') {
        return Err(AppError::Validation {
            message: "capability must be a canonical `pack.action` identifier".to_string(),
            field: Some("capability".to_string()),
            received: Some(json!(req.capability)),
            docs_hint: None,
        });
    }

    let execution_id = state.gateway.dispatcher().enqueue(
        req.workspace_id,
        capability.to_string(),
        req.payload,
    );
    Ok(Json(EnqueueResponse {
        execution_id,
        status: "pending".to_string(),
    }))
}

async fn resolve_workspace(
    state: &AppState,
    client: &AuthenticatedClient,
) -> Result<Uuid, AppError> {
    state
        .gateway
        .resolve_workspace(&client.client_id)
        .await
        .map_err(|err| AppError::WorkspaceUnresolved {
            message: err.to_string(),
        })
}
