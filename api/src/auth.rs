use std::collections::HashSet;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::state::AppState;

/// Authentication configuration resolved once at startup.
///
/// `RELAY_API_KEYS` (comma-separated) restricts callers to a static
/// allowlist; when unset, any non-empty bearer token is accepted and the
/// gateway runs in open (development) mode — logged loudly at startup.
#[derive(Clone)]
pub struct AuthConfig {
    allowed_keys: Option<HashSet<String>>,
    queue_token: Option<String>,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        let allowed_keys = std::env::var("RELAY_API_KEYS").ok().and_then(|raw| {
            let keys: HashSet<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string)
                .collect();
            if keys.is_empty() { None } else { Some(keys) }
        });
        let queue_token = std::env::var("RELAY_QUEUE_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        Self {
            allowed_keys,
            queue_token,
        }
    }

    pub fn open_mode(&self) -> bool {
        self.allowed_keys.is_none()
    }

    pub(crate) fn accepts(&self, token: &str) -> bool {
        match &self.allowed_keys {
            Some(keys) => keys.contains(token),
            None => true,
        }
    }

    /// Validates the backend-facing queue token for the enqueue endpoint.
    pub fn check_queue_token(&self, supplied: Option<&str>) -> Result<(), AppError> {
        let Some(expected) = &self.queue_token else {
            return Err(AppError::Forbidden {
                message: "Task enqueue is disabled".to_string(),
                docs_hint: Some("Set RELAY_QUEUE_TOKEN to enable backend enqueue.".to_string()),
            });
        };
        if supplied != Some(expected.as_str()) {
            return Err(AppError::Forbidden {
                message: "Invalid queue token".to_string(),
                docs_hint: Some("Pass the shared service token in x-relay-queue-token.".to_string()),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests(allowed_keys: Option<HashSet<String>>, queue_token: Option<String>) -> Self {
        Self {
            allowed_keys,
            queue_token,
        }
    }
}

/// Caller identity extracted from the `Authorization: Bearer <token>`
/// header. The identity is a stable fingerprint of the token — the raw
/// token never flows into gateway state.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client_id: String,
}

impl FromRequestParts<AppState> for AuthenticatedClient {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers).map_err(|message| {
            AppError::Unauthorized {
                message: message.to_string(),
                docs_hint: Some("Pass `Authorization: Bearer <token>`.".to_string()),
            }
        })?;
        if !state.auth.accepts(&token) {
            return Err(AppError::Unauthorized {
                message: "Unknown API key".to_string(),
                docs_hint: Some("The token is not in the configured RELAY_API_KEYS set.".to_string()),
            });
        }
        Ok(Self {
            client_id: relay_core::auth::client_fingerprint(&token),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, &'static str> {
    let Some(raw) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err("Missing access token");
    };

    let mut parts = raw.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err("Invalid authorization scheme");
    }
    if token.is_empty() {
        return Err("Missing access token");
    }
    Ok(token.to_string())
}
