use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use relay_core::error::ApiError;
use relay_gateway::TOOL_CONFIRM_REQUEST;

use crate::auth::AuthenticatedClient;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/confirmations", post(issue_confirmation))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct IssueConfirmationRequest {
    /// External tool name the token should authorize
    pub tool_name: String,
    /// Human-readable description of the exact effect. Required for
    /// destructive operations.
    #[serde(default)]
    pub action_preview: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IssueConfirmationResponse {
    pub confirm_token: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_preview: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub single_use: bool,
}

/// Issue a single-use confirmation token for a governed tool. The HTTP
/// route and the `relay_confirm_request` MCP tool share one code path.
#[utoipa::path(
    post,
    path = "/v1/confirmations",
    request_body = IssueConfirmationRequest,
    responses(
        (status = 200, description = "Token issued", body = IssueConfirmationResponse),
        (status = 400, description = "Tool is not confirmation-gated or unknown", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 502, description = "Workspace unresolved", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "confirmations"
)]
pub async fn issue_confirmation(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Json(req): Json<IssueConfirmationRequest>,
) -> Result<Json<IssueConfirmationResponse>, AppError> {
    let mut args = Map::new();
    args.insert("tool_name".to_string(), json!(req.tool_name));
    if let Some(preview) = req.action_preview {
        args.insert("action_preview".to_string(), json!(preview));
    }

    let envelope = state
        .gateway
        .invoke_tool(TOOL_CONFIRM_REQUEST, &args, &client.client_id)
        .await;

    match envelope.get("status").and_then(Value::as_str) {
        Some("ok") => {
            let result = &envelope["result"];
            Ok(Json(IssueConfirmationResponse {
                confirm_token: result["confirm_token"].as_str().unwrap_or_default().to_string(),
                tool_name: result["tool_name"].as_str().unwrap_or_default().to_string(),
                action_preview: result["action_preview"].as_str().map(ToString::to_string),
                expires_at: result["expires_at"]
                    .as_str()
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or_else(Utc::now),
                single_use: true,
            }))
        }
        _ => Err(envelope_to_app_error(&envelope)),
    }
}

fn envelope_to_app_error(envelope: &Value) -> AppError {
    let code = envelope["error"]["error"].as_str().unwrap_or("internal_error");
    let message = envelope["error"]["message"]
        .as_str()
        .unwrap_or("confirmation issue failed")
        .to_string();
    let docs_hint = envelope["error"]["docs_hint"].as_str().map(ToString::to_string);
    match code {
        "workspace_unresolved" => AppError::WorkspaceUnresolved { message },
        "unknown_tool" | "validation_failed" => AppError::Validation {
            message,
            field: envelope["error"]["field"].as_str().map(ToString::to_string),
            received: None,
            docs_hint,
        },
        _ => AppError::Internal(message),
    }
}
