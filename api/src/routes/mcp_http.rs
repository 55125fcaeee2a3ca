use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use serde_json::{Value, json};

use crate::auth::extract_bearer_token;
use crate::state::AppState;

const MCP_PATH: &str = "/mcp";

pub fn router() -> Router<AppState> {
    Router::new().route(MCP_PATH, post(mcp_post).get(mcp_get))
}

async fn mcp_get() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

/// JSON-RPC over HTTP POST. Bearer-authenticated; the token fingerprint
/// becomes the client identity for workspace resolution and lease
/// ownership.
async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let token = match extract_bearer_token(&headers) {
        Ok(token) => token,
        Err(description) => return mcp_auth_challenge(description),
    };
    if !state.auth.accepts(&token) {
        return mcp_auth_challenge("Unknown API key");
    }
    let client_id = relay_core::auth::client_fingerprint(&token);

    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::OK,
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": -32700,
                        "message": "Parse error"
                    }
                })),
            )
                .into_response();
        }
    };

    let responses =
        relay_gateway::server::handle_http_jsonrpc(state.gateway.clone(), client_id, incoming)
            .await;

    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    if responses.len() == 1 {
        return (
            StatusCode::OK,
            Json(responses.into_iter().next().unwrap_or(Value::Null)),
        )
            .into_response();
    }

    (StatusCode::OK, Json(Value::Array(responses))).into_response()
}

fn mcp_auth_challenge(description: &str) -> Response {
    let description = description.replace('"', "'");
    let challenge = format!(
        "Bearer realm=\"relay-mcp\", error=\"invalid_token\", error_description=\"{description}\""
    );
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "invalid_token",
            "error_description": description,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    response
}
