use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use relay_core::receipt::ContextEnvelope;

use crate::catalog::CatalogResponse;
use crate::config::GatewayConfig;

/// The three style-profile ("lens") signatures. Pure passthrough: the
/// gateway never interprets lens payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensOp {
    Get,
    Set,
    Presets,
}

impl LensOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LensOp::Get => "get",
            LensOp::Set => "set",
            LensOp::Presets => "presets",
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("backend returned status {status}")]
    Status { status: u16, body: Value },
    #[error("backend response was not in the expected shape: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Boundary errors are never retried by the gateway; the retry policy
    /// belongs to the caller. This tag tells the caller which class it is.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Unreachable(_) => "backend_unreachable",
            BackendError::Timeout => "backend_timeout",
            BackendError::Status { .. } => "backend_error",
            BackendError::InvalidResponse(_) => "backend_invalid_response",
        }
    }
}

/// Outbound boundary to the capability execution engine. Everything the
/// gateway needs from the backend goes through this trait, so tests (and
/// a future shared-store deployment) can substitute the transport.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Forwards a capability invocation keyed by canonical identity.
    async fn invoke(
        &self,
        canonical: &str,
        workspace_id: Uuid,
        payload: &Value,
        context: Option<&ContextEnvelope>,
    ) -> Result<Value, BackendError>;

    /// Lists the backend's capability catalog (packs + macro workflows).
    async fn catalog(&self) -> Result<CatalogResponse, BackendError>;

    /// Resolve-or-provision a workspace for an external client key.
    async fn resolve_workspace(&self, external_key: &str) -> Result<Uuid, BackendError>;

    /// Style-profile passthrough.
    async fn lens(
        &self,
        op: LensOp,
        workspace_id: Uuid,
        body: Option<Value>,
    ) -> Result<Value, BackendError>;
}

/// HTTP implementation over the backend's REST surface.
pub struct HttpBackendClient {
    base_url: String,
    auth_token: Option<String>,
    http: Client,
}

impl HttpBackendClient {
    pub fn new(
        mut base_url: String,
        auth_token: Option<String>,
        config: &GatewayConfig,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .connect_timeout(config.backend_connect_timeout)
            .timeout(config.backend_request_timeout)
            .build()
            .map_err(|err| BackendError::Unreachable(err.to_string()))?;
        let trimmed_len = base_url.trim_end_matches('/').len();
        base_url.truncate(trimmed_len);
        Ok(Self {
            base_url,
            auth_token,
            http,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Unreachable(err.to_string())
            }
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BackendError::Unreachable(err.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
        };
        Ok((status, body))
    }

    fn expect_success(status: StatusCode, body: Value) -> Result<Value, BackendError> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn invoke(
        &self,
        canonical: &str,
        workspace_id: Uuid,
        payload: &Value,
        context: Option<&ContextEnvelope>,
    ) -> Result<Value, BackendError> {
        let mut body = json!({
            "capability": canonical,
            "workspace_id": workspace_id,
            "payload": payload,
        });
        if let Some(context) = context {
            if !context.receipts.is_empty() {
                body["context"] = serde_json::to_value(context)
                    .map_err(|err| BackendError::InvalidResponse(err.to_string()))?;
            }
        }
        let (status, body) = self
            .send(Method::POST, "/v1/capabilities/invoke", Some(&body))
            .await?;
        Self::expect_success(status, body)
    }

    async fn catalog(&self) -> Result<CatalogResponse, BackendError> {
        let (status, body) = self.send(Method::GET, "/v1/capabilities/catalog", None).await?;
        let body = Self::expect_success(status, body)?;
        serde_json::from_value(body).map_err(|err| BackendError::InvalidResponse(err.to_string()))
    }

    async fn resolve_workspace(&self, external_key: &str) -> Result<Uuid, BackendError> {
        let (status, body) = self
            .send(
                Method::POST,
                "/v1/workspaces/resolve",
                Some(&json!({ "external_key": external_key })),
            )
            .await?;
        let body = Self::expect_success(status, body)?;
        let raw = body
            .get("workspace_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::InvalidResponse("missing workspace_id in resolve response".to_string())
            })?;
        Uuid::parse_str(raw)
            .map_err(|_| BackendError::InvalidResponse(format!("invalid workspace_id '{raw}'")))
    }

    async fn lens(
        &self,
        op: LensOp,
        workspace_id: Uuid,
        body: Option<Value>,
    ) -> Result<Value, BackendError> {
        let (method, path) = match op {
            LensOp::Get => (Method::GET, format!("/v1/lens/{workspace_id}")),
            LensOp::Set => (Method::PUT, format!("/v1/lens/{workspace_id}")),
            LensOp::Presets => (Method::GET, "/v1/lens/presets".to_string()),
        };
        let (status, body) = self.send(method, &path, body.as_ref()).await?;
        Self::expect_success(status, body)
    }
}
