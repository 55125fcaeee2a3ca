use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendClient;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace key is empty")]
    InvalidKey,
    #[error("workspace provisioning failed: {0}")]
    ProvisioningFailed(String),
}

/// Resolves an external client key to an execution workspace,
/// provisioning one when none exists. This is a trust boundary: failure
/// must fail the invocation closed, never fall through to a default
/// workspace.
#[async_trait]
pub trait WorkspaceAuthority: Send + Sync {
    async fn resolve(&self, external_key: &str) -> Result<Uuid, WorkspaceError>;
}

/// Fixed authority for standalone/single-tenant deployments: every key
/// resolves to the same workspace.
pub struct StaticWorkspaceAuthority {
    workspace_id: Uuid,
}

impl StaticWorkspaceAuthority {
    pub fn new(workspace_id: Uuid) -> Self {
        Self { workspace_id }
    }
}

#[async_trait]
impl WorkspaceAuthority for StaticWorkspaceAuthority {
    async fn resolve(&self, external_key: &str) -> Result<Uuid, WorkspaceError> {
        if external_key.trim().is_empty() {
            return Err(WorkspaceError::InvalidKey);
        }
        Ok(self.workspace_id)
    }
}

/// Backend-backed authority with a TTL cache so repeated invocations by
/// the same client do not re-hit the backend.
pub struct BackendWorkspaceAuthority {
    backend: Arc<dyn BackendClient>,
    cache: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
    ttl: Duration,
}

impl BackendWorkspaceAuthority {
    pub fn new(backend: Arc<dyn BackendClient>, ttl: Duration) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn cached(&self, external_key: &str, now: DateTime<Utc>) -> Option<Uuid> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - chrono::Duration::seconds(self.ttl.as_secs() as i64);
        cache.retain(|_, (_, resolved_at)| *resolved_at > cutoff);
        cache.get(external_key).map(|(workspace_id, _)| *workspace_id)
    }

    fn store(&self, external_key: &str, workspace_id: Uuid, now: DateTime<Utc>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(external_key.to_string(), (workspace_id, now));
    }
}

#[async_trait]
impl WorkspaceAuthority for BackendWorkspaceAuthority {
    async fn resolve(&self, external_key: &str) -> Result<Uuid, WorkspaceError> {
        if external_key.trim().is_empty() {
            return Err(WorkspaceError::InvalidKey);
        }
        let now = Utc::now();
        if let Some(workspace_id) = self.cached(external_key, now) {
            return Ok(workspace_id);
        }
        let workspace_id = self
            .backend
            .resolve_workspace(external_key)
            .await
            .map_err(|err| WorkspaceError::ProvisioningFailed(err.to_string()))?;
        self.store(external_key, workspace_id, now);
        tracing::debug!(
            event = "workspace_resolved",
            workspace_id = %workspace_id,
            "workspace resolved"
        );
        Ok(workspace_id)
    }
}
