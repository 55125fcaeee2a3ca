use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use relay_core::receipt::ContextEnvelope;

pub mod backend;
pub mod catalog;
pub mod config;
pub mod confirm;
pub mod dispatch;
pub mod identity;
pub mod policy;
pub mod server;
pub mod store;
pub mod util;
pub mod workspace;

use backend::{BackendClient, LensOp};
use catalog::{MappedTool, map_catalog};
use config::GatewayConfig;
use confirm::ConfirmationService;
use dispatch::TaskDispatcher;
use identity::IdentityResolver;
use policy::{AccessPolicy, AccessRule, AccessTier};
use store::{ConfirmTokenStore, MemoryConfirmTokenStore, MemoryTaskStore, TaskStore};
use workspace::{WorkspaceAuthority, WorkspaceError};

/// Intrinsic gateway tools — owned by the gateway itself, outside the
/// three-tier capability namespace.
pub const TOOL_CONFIRM_REQUEST: &str = "relay_confirm_request";
pub const TOOL_GATEWAY_STATUS: &str = "relay_mcp_status";
pub const TOOL_LENS_GET: &str = "relay_lens_get";
pub const TOOL_LENS_SET: &str = "relay_lens_set";
pub const TOOL_LENS_PRESETS: &str = "relay_lens_presets";

const INTRINSIC_TOOLS: [&str; 5] = [
    TOOL_CONFIRM_REQUEST,
    TOOL_GATEWAY_STATUS,
    TOOL_LENS_GET,
    TOOL_LENS_SET,
    TOOL_LENS_PRESETS,
];

const SUGGESTION_MIN_SIMILARITY: f64 = 0.84;

/// One entry of the exposed tool surface, ready for MCP `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Structured tool-level error. Everything an agent needs to self-correct:
/// machine code, message, offending field, usage hint, details.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub docs_hint: Option<String>,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

struct CatalogState {
    known_names: Vec<String>,
    degraded: bool,
    last_error: Option<String>,
    loaded_at: Option<DateTime<Utc>>,
}

/// The gateway façade: composes identity resolution, access policy,
/// confirmation, dispatch, workspace resolution and the backend boundary
/// for the two externally visible operations — list tools and invoke.
///
/// Request-scoped and stateless per call; all shared state (tokens,
/// leases) lives behind the injected store traits.
pub struct Gateway {
    config: GatewayConfig,
    resolver: IdentityResolver,
    policy: AccessPolicy,
    confirm: ConfirmationService,
    dispatcher: TaskDispatcher,
    workspace: Arc<dyn WorkspaceAuthority>,
    backend: Arc<dyn BackendClient>,
    primitive_limiter: DefaultKeyedRateLimiter<String>,
    governed_limiter: DefaultKeyedRateLimiter<String>,
    catalog_state: Mutex<CatalogState>,
}

impl Gateway {
    /// Gateway over in-memory stores — the single-process deployment.
    pub fn new(
        config: GatewayConfig,
        backend: Arc<dyn BackendClient>,
        workspace: Arc<dyn WorkspaceAuthority>,
    ) -> Self {
        Self::with_stores(
            config,
            backend,
            workspace,
            Arc::new(MemoryConfirmTokenStore::default()),
            Arc::new(MemoryTaskStore::default()),
        )
    }

    /// Gateway over externally provided stores (shared KV in a
    /// multi-instance deployment).
    pub fn with_stores(
        config: GatewayConfig,
        backend: Arc<dyn BackendClient>,
        workspace: Arc<dyn WorkspaceAuthority>,
        confirm_store: Arc<dyn ConfirmTokenStore>,
        task_store: Arc<dyn TaskStore>,
    ) -> Self {
        let resolver = IdentityResolver::new(
            config.namespace.clone(),
            config.strict_packs,
            config.pack_registry_ttl,
        );
        let policy = AccessPolicy::with_defaults(
            config.primitive_calls_per_minute,
            config.governed_calls_per_minute,
        );
        let confirm = ConfirmationService::new(confirm_store, config.confirm_ttl);
        let dispatcher = TaskDispatcher::new(task_store, config.dispatch);
        let primitive_limiter =
            RateLimiter::keyed(Quota::per_minute(non_zero(config.primitive_calls_per_minute)));
        let governed_limiter =
            RateLimiter::keyed(Quota::per_minute(non_zero(config.governed_calls_per_minute)));
        Self {
            config,
            resolver,
            policy,
            confirm,
            dispatcher,
            workspace,
            backend,
            primitive_limiter,
            governed_limiter,
            catalog_state: Mutex::new(CatalogState {
                known_names: Vec::new(),
                degraded: false,
                last_error: None,
                loaded_at: None,
            }),
        }
    }

    /// Inserts an environment-specific policy rule at highest precedence.
    /// Only available before the gateway is shared.
    pub fn push_policy_rule(&mut self, rule: AccessRule) {
        self.policy.push_front(rule);
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn confirmations(&self) -> &ConfirmationService {
        &self.confirm
    }

    pub fn namespace(&self) -> &str {
        self.resolver.namespace()
    }

    pub async fn resolve_workspace(&self, client_id: &str) -> Result<Uuid, WorkspaceError> {
        self.workspace.resolve(client_id).await
    }

    /// Builds the exposed tool surface: intrinsic tools plus the mapped
    /// backend catalog. A catalog failure degrades to intrinsic-only —
    /// discovery stays available while the backend is down.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = intrinsic_tool_descriptors(self.resolver.namespace());

        match self.backend.catalog().await {
            Ok(catalog) => {
                let now = Utc::now();
                self.resolver.registry().replace(
                    catalog.packs.iter().map(|pack| pack.name.clone()),
                    now,
                );
                let mapped = map_catalog(&catalog, &self.resolver, &self.policy);
                let mut state = self.catalog_state.lock().unwrap_or_else(|e| e.into_inner());
                state.known_names = mapped.iter().map(|tool| tool.name.clone()).collect();
                state.degraded = false;
                state.last_error = None;
                state.loaded_at = Some(now);
                drop(state);
                tools.extend(mapped.into_iter().map(descriptor_from_mapped));
            }
            Err(err) => {
                tracing::warn!(
                    event = "catalog_unavailable",
                    error = %err,
                    "tool listing degraded to intrinsic tools"
                );
                let mut state = self.catalog_state.lock().unwrap_or_else(|e| e.into_inner());
                state.degraded = true;
                state.last_error = Some(err.to_string());
            }
        }
        tools
    }

    /// Invokes a tool on behalf of `client_id`. Always returns a tagged
    /// envelope — `ok`, `confirmation_required`, or `error` — never
    /// panics and never surfaces a raw transport failure.
    pub async fn invoke_tool(&self, name: &str, args: &Map<String, Value>, client_id: &str) -> Value {
        if INTRINSIC_TOOLS.contains(&name) {
            return self.invoke_intrinsic(name, args, client_id).await;
        }

        let Some((identity, _tag)) = self.resolver.parse_external_name(name) else {
            return error_envelope(name, self.unknown_tool_error(name));
        };
        if let Err(err) = self.resolver.verify_pack(&identity) {
            return error_envelope(
                name,
                ToolError::new("unknown_pack", err.to_string())
                    .with_field("name")
                    .with_docs_hint("List available tools via tools/list."),
            );
        }

        // Workspace resolution fails the invocation closed: no default
        // workspace, no fallthrough.
        let workspace_id = match self.workspace.resolve(client_id).await {
            Ok(workspace_id) => workspace_id,
            Err(err) => return error_envelope(name, workspace_error(err)),
        };

        let decision = self.policy.classify(name);
        if !decision.allowed {
            tracing::warn!(
                event = "tool_access_denied",
                tool = name,
                reason = %decision.reason,
                "invocation denied"
            );
            return error_envelope(
                name,
                ToolError::new("access_denied", format!("Access denied: {}", decision.reason)),
            );
        }

        if let Err(limited) = self.check_rate(&decision.tier, client_id, name) {
            return error_envelope(name, limited);
        }

        let payload = match extract_payload(args) {
            Ok(payload) => payload,
            Err(err) => return error_envelope(name, err),
        };
        let context = match extract_context(args) {
            Ok(context) => context,
            Err(err) => return error_envelope(name, err),
        };

        if decision.constraints.requires_confirmation {
            let token = args.get("confirm_token").and_then(Value::as_str);
            let Some(token) = token else {
                return confirmation_required_envelope(name, workspace_id, &decision);
            };
            let redemption = self.confirm.redeem(token, workspace_id, name);
            if !redemption.valid {
                let reason = redemption.reason.unwrap_or("invalid");
                return error_envelope(
                    name,
                    ToolError::new(
                        "confirmation_rejected",
                        format!("Confirmation token rejected: {reason}"),
                    )
                    .with_field("confirm_token")
                    .with_docs_hint(format!(
                        "Request a fresh token via {TOOL_CONFIRM_REQUEST} and retry."
                    )),
                );
            }
            if decision.constraints.requires_preview && redemption.action_preview.is_none() {
                return error_envelope(
                    name,
                    ToolError::new(
                        "confirmation_rejected",
                        "This operation requires a token issued with an action preview",
                    )
                    .with_field("confirm_token")
                    .with_docs_hint(format!(
                        "Re-issue via {TOOL_CONFIRM_REQUEST} with action_preview describing the exact effect, then retry."
                    )),
                );
            }
        }

        match self
            .backend
            .invoke(&identity.canonical(), workspace_id, &payload, context.as_ref())
            .await
        {
            Ok(result) => ok_envelope(name, Some(workspace_id), result),
            Err(err) => {
                tracing::error!(
                    event = "backend_invoke_failed",
                    tool = name,
                    error = %err,
                    "backend invocation failed"
                );
                error_envelope(
                    name,
                    ToolError::new(err.code(), err.to_string()).with_docs_hint(
                        "The gateway does not retry backend failures; retry the call if appropriate.",
                    ),
                )
            }
        }
    }

    async fn invoke_intrinsic(&self, name: &str, args: &Map<String, Value>, client_id: &str) -> Value {
        match name {
            TOOL_GATEWAY_STATUS => ok_envelope(name, None, self.status_value()),
            TOOL_CONFIRM_REQUEST => self.handle_confirm_request(args, client_id).await,
            TOOL_LENS_GET | TOOL_LENS_SET | TOOL_LENS_PRESETS => {
                self.handle_lens(name, args, client_id).await
            }
            _ => error_envelope(name, self.unknown_tool_error(name)),
        }
    }

    async fn handle_confirm_request(&self, args: &Map<String, Value>, client_id: &str) -> Value {
        let Some(tool_name) = args.get("tool_name").and_then(Value::as_str) else {
            return error_envelope(
                TOOL_CONFIRM_REQUEST,
                ToolError::new("validation_failed", "tool_name is required")
                    .with_field("tool_name"),
            );
        };
        if self.resolver.parse_external_name(tool_name).is_none() {
            return error_envelope(TOOL_CONFIRM_REQUEST, self.unknown_tool_error(tool_name));
        }
        let decision = self.policy.classify(tool_name);
        if !decision.allowed || !decision.constraints.requires_confirmation {
            return error_envelope(
                TOOL_CONFIRM_REQUEST,
                ToolError::new(
                    "validation_failed",
                    format!("'{tool_name}' does not take confirmation tokens"),
                )
                .with_field("tool_name")
                .with_docs_hint("Only governed (run_/playbook_) tools are confirmation-gated."),
            );
        }
        let workspace_id = match self.workspace.resolve(client_id).await {
            Ok(workspace_id) => workspace_id,
            Err(err) => return error_envelope(TOOL_CONFIRM_REQUEST, workspace_error(err)),
        };
        let action_preview = args
            .get("action_preview")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let token = self.confirm.issue(workspace_id, tool_name, action_preview);
        ok_envelope(
            TOOL_CONFIRM_REQUEST,
            Some(workspace_id),
            json!({
                "confirm_token": token.token,
                "tool_name": token.tool_name,
                "action_preview": token.action_preview,
                "expires_at": token.expires_at,
                "single_use": true,
            }),
        )
    }

    async fn handle_lens(&self, name: &str, args: &Map<String, Value>, client_id: &str) -> Value {
        let workspace_id = match self.workspace.resolve(client_id).await {
            Ok(workspace_id) => workspace_id,
            Err(err) => return error_envelope(name, workspace_error(err)),
        };
        let (op, body) = match name {
            TOOL_LENS_SET => {
                let Some(profile) = args.get("profile").filter(|v| v.is_object()) else {
                    return error_envelope(
                        name,
                        ToolError::new("validation_failed", "profile object is required")
                            .with_field("profile"),
                    );
                };
                (LensOp::Set, Some(profile.clone()))
            }
            TOOL_LENS_PRESETS => (LensOp::Presets, None),
            _ => (LensOp::Get, None),
        };
        match self.backend.lens(op, workspace_id, body).await {
            Ok(result) => ok_envelope(name, Some(workspace_id), result),
            Err(err) => error_envelope(name, ToolError::new(err.code(), err.to_string())),
        }
    }

    fn check_rate(&self, tier: &AccessTier, client_id: &str, name: &str) -> Result<(), ToolError> {
        let limiter = match tier {
            AccessTier::Primitive => &self.primitive_limiter,
            _ => &self.governed_limiter,
        };
        let key = format!("{client_id}|{name}");
        if limiter.check_key(&key).is_err() {
            tracing::warn!(event = "tool_rate_limited", tool = name, "per-tool quota hit");
            return Err(ToolError::new(
                "rate_limited",
                format!("Per-tool call quota exceeded for '{name}'"),
            )
            .with_docs_hint("Back off and retry after the current minute window."));
        }
        Ok(())
    }

    fn unknown_tool_error(&self, name: &str) -> ToolError {
        let mut err = ToolError::new("unknown_tool", format!("Unknown tool '{name}'"));
        if let Some(suggestion) = self.suggest_tool_name(name) {
            err = err
                .with_docs_hint(format!("Did you mean '{suggestion}'?"))
                .with_details(json!({ "suggestion": suggestion }));
        } else {
            err = err.with_docs_hint("List available tools via tools/list.");
        }
        err
    }

    fn suggest_tool_name(&self, name: &str) -> Option<String> {
        let state = self.catalog_state.lock().unwrap_or_else(|e| e.into_inner());
        let candidates = INTRINSIC_TOOLS
            .iter()
            .map(|intrinsic| intrinsic.to_string())
            .chain(state.known_names.iter().cloned());
        candidates
            .map(|candidate| {
                let score = strsim::jaro_winkler(name, &candidate);
                (candidate, score)
            })
            .filter(|(_, score)| *score >= SUGGESTION_MIN_SIMILARITY)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(candidate, _)| candidate)
    }

    /// Gateway status snapshot served by `relay_mcp_status`.
    pub fn status_value(&self) -> Value {
        let state = self.catalog_state.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "server": server::MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "namespace": self.resolver.namespace(),
            "strict_packs": self.config.strict_packs,
            "catalog": {
                "degraded": state.degraded,
                "loaded_at": state.loaded_at,
                "exposed_tools": state.known_names.len(),
                "last_error": state.last_error,
            },
            "pack_registry_refreshed_at": self.resolver.registry().refreshed_at(),
            "confirm_ttl_secs": self.config.confirm_ttl.as_secs(),
            "dispatch": {
                "ack_lease_secs": self.config.dispatch.ack_lease_secs,
                "lease_ceiling_secs": self.config.dispatch.lease_ceiling_secs,
                "retention_secs": self.config.dispatch.retention_secs,
            },
        })
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value.max(1)).unwrap_or(NonZeroU32::MIN)
}

fn descriptor_from_mapped(tool: MappedTool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name,
        description: tool.description,
        input_schema: tool.input_schema,
    }
}

fn intrinsic_tool_descriptors(namespace: &str) -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: TOOL_GATEWAY_STATUS.to_string(),
            description: "Gateway status: catalog freshness, namespace, dispatch limits.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDescriptor {
            name: TOOL_CONFIRM_REQUEST.to_string(),
            description: format!(
                "Request a single-use confirmation token for a governed ({namespace}_run_*/{namespace}_playbook_*) tool."
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_name": { "type": "string" },
                    "action_preview": {
                        "type": "string",
                        "description": "Human-readable description of the exact effect. Required for destructive operations."
                    }
                },
                "required": ["tool_name"],
                "additionalProperties": false
            }),
        },
        ToolDescriptor {
            name: TOOL_LENS_GET.to_string(),
            description: "Fetch the workspace style profile (passthrough).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDescriptor {
            name: TOOL_LENS_SET.to_string(),
            description: "Replace the workspace style profile (passthrough).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "profile": { "type": "object" }
                },
                "required": ["profile"],
                "additionalProperties": false
            }),
        },
        ToolDescriptor {
            name: TOOL_LENS_PRESETS.to_string(),
            description: "List available style profile presets (passthrough).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
    ]
}

fn extract_payload(args: &Map<String, Value>) -> Result<Value, ToolError> {
    match args.get("payload") {
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        Some(Value::Null) | None => Ok(json!({})),
        Some(other) => Err(ToolError::new("validation_failed", "payload must be an object")
            .with_field("payload")
            .with_details(json!({ "received": other }))),
    }
}

fn extract_context(args: &Map<String, Value>) -> Result<Option<ContextEnvelope>, ToolError> {
    let Some(raw) = args.get("context") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let context: ContextEnvelope = serde_json::from_value(raw.clone()).map_err(|err| {
        ToolError::new("validation_failed", format!("context envelope is malformed: {err}"))
            .with_field("context")
    })?;
    // Structural shape only — the gateway never validates what a receipt
    // digest actually covers.
    context.validate_shape().map_err(|err| {
        ToolError::new("validation_failed", err.to_string()).with_field("context.receipts")
    })?;
    Ok(Some(context))
}

pub(crate) fn ok_envelope(tool: &str, workspace_id: Option<Uuid>, result: Value) -> Value {
    let mut envelope = json!({
        "status": "ok",
        "tool": tool,
        "result": result,
    });
    if let Some(workspace_id) = workspace_id {
        envelope["workspace_id"] = json!(workspace_id);
    }
    envelope
}

pub(crate) fn error_envelope(tool: &str, error: ToolError) -> Value {
    json!({
        "status": "error",
        "tool": tool,
        "error": error.to_value(),
    })
}

fn confirmation_required_envelope(
    tool: &str,
    workspace_id: Uuid,
    decision: &policy::AccessDecision,
) -> Value {
    json!({
        "status": "confirmation_required",
        "tool": tool,
        "workspace_id": workspace_id,
        "confirmation": {
            "reason": decision.reason,
            "requires_preview": decision.constraints.requires_preview,
            "next_action": TOOL_CONFIRM_REQUEST,
            "docs_hint": format!(
                "Call {TOOL_CONFIRM_REQUEST} with tool_name=\"{tool}\"{} to obtain a single-use confirm_token, then retry this call with it.",
                if decision.constraints.requires_preview {
                    " and an action_preview"
                } else {
                    ""
                }
            ),
        },
    })
}

fn workspace_error(err: WorkspaceError) -> ToolError {
    ToolError::new("workspace_unresolved", err.to_string()).with_docs_hint(
        "The execution workspace could not be resolved or provisioned; retry once the backend is reachable.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::backend::BackendError;
    use crate::catalog::{CatalogAction, CatalogPack, CatalogResponse, CatalogWorkflow};
    use crate::workspace::StaticWorkspaceAuthority;

    struct StubBackend {
        workspace_id: Uuid,
        fail_catalog: bool,
        invocations: Mutex<Vec<(String, Uuid, Value, bool)>>,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                workspace_id: Uuid::now_v7(),
                fail_catalog: false,
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn invoke(
            &self,
            canonical: &str,
            workspace_id: Uuid,
            payload: &Value,
            context: Option<&ContextEnvelope>,
        ) -> Result<Value, BackendError> {
            self.invocations.lock().unwrap().push((
                canonical.to_string(),
                workspace_id,
                payload.clone(),
                context.is_some(),
            ));
            Ok(json!({ "echo": canonical }))
        }

        async fn catalog(&self) -> Result<CatalogResponse, BackendError> {
            if self.fail_catalog {
                return Err(BackendError::Timeout);
            }
            Ok(CatalogResponse {
                packs: vec![CatalogPack {
                    name: "notes".to_string(),
                    actions: vec![
                        CatalogAction {
                            name: "search".to_string(),
                            description: None,
                            input_schema: None,
                        },
                        CatalogAction {
                            name: "delete_archive".to_string(),
                            description: None,
                            input_schema: None,
                        },
                        CatalogAction {
                            name: "update_note".to_string(),
                            description: None,
                            input_schema: None,
                        },
                    ],
                }],
                workflows: vec![CatalogWorkflow {
                    name: "weekly_digest".to_string(),
                    pack: None,
                    description: None,
                }],
            })
        }

        async fn resolve_workspace(&self, _external_key: &str) -> Result<Uuid, BackendError> {
            Ok(self.workspace_id)
        }

        async fn lens(
            &self,
            op: LensOp,
            _workspace_id: Uuid,
            body: Option<Value>,
        ) -> Result<Value, BackendError> {
            Ok(json!({ "op": op.as_str(), "body": body }))
        }
    }

    struct FailingWorkspaceAuthority;

    #[async_trait]
    impl WorkspaceAuthority for FailingWorkspaceAuthority {
        async fn resolve(&self, _external_key: &str) -> Result<Uuid, WorkspaceError> {
            Err(WorkspaceError::ProvisioningFailed("backend said no".to_string()))
        }
    }

    const CLIENT: &str = "cid-test000000000";

    fn gateway_with(backend: StubBackend) -> (Arc<StubBackend>, Gateway) {
        let workspace_id = backend.workspace_id;
        let backend = Arc::new(backend);
        let gateway = Gateway::new(
            GatewayConfig::default(),
            backend.clone(),
            Arc::new(StaticWorkspaceAuthority::new(workspace_id)),
        );
        (backend, gateway)
    }

    fn gateway() -> (Arc<StubBackend>, Gateway) {
        gateway_with(StubBackend::new())
    }

    fn args(entries: Value) -> Map<String, Value> {
        entries.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn list_tools_exposes_intrinsic_and_catalog_tools() {
        let (_, gateway) = gateway();
        let tools = gateway.list_tools().await;
        let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();

        assert!(names.contains(&TOOL_CONFIRM_REQUEST));
        assert!(names.contains(&TOOL_GATEWAY_STATUS));
        assert!(names.contains(&"relay_tool_notes_search"));
        assert!(names.contains(&"relay_run_notes_delete_archive"));
        assert!(names.contains(&"relay_run_notes_update_note"));
        assert!(names.contains(&"relay_playbook_flows_weekly_digest"));
    }

    #[tokio::test]
    async fn list_tools_degrades_to_intrinsic_when_catalog_fails() {
        let mut backend = StubBackend::new();
        backend.fail_catalog = true;
        let (_, gateway) = gateway_with(backend);

        let tools = gateway.list_tools().await;
        assert_eq!(tools.len(), INTRINSIC_TOOLS.len());
        assert_eq!(gateway.status_value()["catalog"]["degraded"], true);
    }

    #[tokio::test]
    async fn primitive_invocation_forwards_canonical_identity() {
        let (backend, gateway) = gateway();
        let envelope = gateway
            .invoke_tool(
                "relay_tool_notes_search",
                &args(json!({ "payload": { "query": "tax" } })),
                CLIENT,
            )
            .await;

        assert_eq!(envelope["status"], "ok");
        let invocations = backend.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        // Only the canonical identity crosses the boundary, never the
        // external name.
        assert_eq!(invocations[0].0, "notes.search");
        assert_eq!(invocations[0].2["query"], "tax");
    }

    #[tokio::test]
    async fn governed_invocation_walks_the_confirmation_flow() {
        let (backend, gateway) = gateway();
        let tool = "relay_run_notes_update_note";

        // 1. No token: structured confirmation_required, not an error.
        let first = gateway
            .invoke_tool(tool, &args(json!({ "payload": {} })), CLIENT)
            .await;
        assert_eq!(first["status"], "confirmation_required");
        assert_eq!(first["confirmation"]["next_action"], TOOL_CONFIRM_REQUEST);
        assert!(backend.invocations.lock().unwrap().is_empty());

        // 2. Issue a token through the intrinsic tool.
        let issued = gateway
            .invoke_tool(
                TOOL_CONFIRM_REQUEST,
                &args(json!({ "tool_name": tool })),
                CLIENT,
            )
            .await;
        assert_eq!(issued["status"], "ok");
        let token = issued["result"]["confirm_token"].as_str().unwrap().to_string();

        // 3. Same call with the token succeeds.
        let second = gateway
            .invoke_tool(
                tool,
                &args(json!({ "payload": {}, "confirm_token": token })),
                CLIENT,
            )
            .await;
        assert_eq!(second["status"], "ok");
        assert_eq!(backend.invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consumed_token_cannot_be_replayed() {
        let (_, gateway) = gateway();
        let tool = "relay_run_notes_update_note";
        let issued = gateway
            .invoke_tool(TOOL_CONFIRM_REQUEST, &args(json!({ "tool_name": tool })), CLIENT)
            .await;
        let token = issued["result"]["confirm_token"].as_str().unwrap().to_string();

        let first = gateway
            .invoke_tool(tool, &args(json!({ "confirm_token": token })), CLIENT)
            .await;
        assert_eq!(first["status"], "ok");

        let replay = gateway
            .invoke_tool(tool, &args(json!({ "confirm_token": token })), CLIENT)
            .await;
        assert_eq!(replay["status"], "error");
        assert_eq!(replay["error"]["error"], "confirmation_rejected");
        assert!(
            replay["error"]["message"].as_str().unwrap().contains("not found"),
            "second redemption must read as not found"
        );
    }

    #[tokio::test]
    async fn destructive_tools_demand_a_preview_bearing_token() {
        let (_, gateway) = gateway();
        let tool = "relay_run_notes_delete_archive";

        let issued = gateway
            .invoke_tool(TOOL_CONFIRM_REQUEST, &args(json!({ "tool_name": tool })), CLIENT)
            .await;
        let token = issued["result"]["confirm_token"].as_str().unwrap().to_string();

        let rejected = gateway
            .invoke_tool(tool, &args(json!({ "confirm_token": token })), CLIENT)
            .await;
        assert_eq!(rejected["status"], "error");
        assert_eq!(rejected["error"]["error"], "confirmation_rejected");

        let issued = gateway
            .invoke_tool(
                TOOL_CONFIRM_REQUEST,
                &args(json!({
                    "tool_name": tool,
                    "action_preview": "deletes 3 archived notes older than 90 days"
                })),
                CLIENT,
            )
            .await;
        let token = issued["result"]["confirm_token"].as_str().unwrap().to_string();
        let accepted = gateway
            .invoke_tool(tool, &args(json!({ "confirm_token": token })), CLIENT)
            .await;
        assert_eq!(accepted["status"], "ok");
    }

    #[tokio::test]
    async fn internal_names_are_denied() {
        let (backend, gateway) = gateway();
        let envelope = gateway
            .invoke_tool("relay_tool_ops_admin_reload", &Map::new(), CLIENT)
            .await;
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["error"], "access_denied");
        assert!(backend.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_names_get_a_suggestion() {
        let (_, gateway) = gateway();
        gateway.list_tools().await; // populate known names

        // "tools" is not a valid tier tag, so the name fails to parse.
        let envelope = gateway
            .invoke_tool("relay_tools_notes_search", &Map::new(), CLIENT)
            .await;
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["error"], "unknown_tool");
        assert_eq!(
            envelope["error"]["details"]["suggestion"],
            "relay_tool_notes_search"
        );
    }

    #[tokio::test]
    async fn strict_mode_rejects_packs_missing_from_a_fresh_registry() {
        let backend = StubBackend::new();
        let workspace_id = backend.workspace_id;
        let config = GatewayConfig {
            strict_packs: true,
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(
            config,
            Arc::new(backend),
            Arc::new(StaticWorkspaceAuthority::new(workspace_id)),
        );

        // Before any catalog refresh the registry is stale: degrade
        // gracefully and let the backend decide.
        let degraded = gateway
            .invoke_tool("relay_tool_crm_list_contacts", &Map::new(), CLIENT)
            .await;
        assert_eq!(degraded["status"], "ok");

        // list_tools refreshes the registry with the catalog's packs.
        gateway.list_tools().await;
        let rejected = gateway
            .invoke_tool("relay_tool_crm_list_contacts", &Map::new(), CLIENT)
            .await;
        assert_eq!(rejected["status"], "error");
        assert_eq!(rejected["error"]["error"], "unknown_pack");

        let known = gateway
            .invoke_tool("relay_tool_notes_search", &Map::new(), CLIENT)
            .await;
        assert_eq!(known["status"], "ok");
    }

    #[tokio::test]
    async fn workspace_failure_fails_closed() {
        let backend = Arc::new(StubBackend::new());
        let gateway = Gateway::new(
            GatewayConfig::default(),
            backend.clone(),
            Arc::new(FailingWorkspaceAuthority),
        );

        let envelope = gateway
            .invoke_tool("relay_tool_notes_search", &Map::new(), CLIENT)
            .await;
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["error"], "workspace_unresolved");
        assert!(backend.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_receipts_are_rejected_valid_ones_forwarded() {
        let (backend, gateway) = gateway();
        let tool = "relay_tool_notes_search";

        let bad = gateway
            .invoke_tool(
                tool,
                &args(json!({
                    "context": { "receipts": [{ "step": "dedupe", "digest": "xyz", "algorithm": "sha256" }] }
                })),
                CLIENT,
            )
            .await;
        assert_eq!(bad["status"], "error");
        assert_eq!(bad["error"]["error"], "validation_failed");
        assert!(backend.invocations.lock().unwrap().is_empty());

        let digest = "ab12".repeat(16);
        let good = gateway
            .invoke_tool(
                tool,
                &args(json!({
                    "context": { "receipts": [{ "step": "dedupe", "digest": digest, "algorithm": "sha256" }] }
                })),
                CLIENT,
            )
            .await;
        assert_eq!(good["status"], "ok");
        let invocations = backend.invocations.lock().unwrap();
        assert!(invocations[0].3, "receipts must be forwarded to the backend");
    }

    #[tokio::test]
    async fn per_tool_quota_rejects_excess_calls() {
        let backend = StubBackend::new();
        let workspace_id = backend.workspace_id;
        let config = GatewayConfig {
            primitive_calls_per_minute: 2,
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(
            config,
            Arc::new(backend),
            Arc::new(StaticWorkspaceAuthority::new(workspace_id)),
        );

        let tool = "relay_tool_notes_search";
        for _ in 0..2 {
            let ok = gateway.invoke_tool(tool, &Map::new(), CLIENT).await;
            assert_eq!(ok["status"], "ok");
        }
        let limited = gateway.invoke_tool(tool, &Map::new(), CLIENT).await;
        assert_eq!(limited["status"], "error");
        assert_eq!(limited["error"]["error"], "rate_limited");

        // A different tool has its own bucket.
        let other = gateway
            .invoke_tool("relay_tool_notes_list", &Map::new(), CLIENT)
            .await;
        assert_eq!(other["status"], "ok");
    }

    #[tokio::test]
    async fn confirm_request_rejects_primitive_tools() {
        let (_, gateway) = gateway();
        let envelope = gateway
            .invoke_tool(
                TOOL_CONFIRM_REQUEST,
                &args(json!({ "tool_name": "relay_tool_notes_search" })),
                CLIENT,
            )
            .await;
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["error"], "validation_failed");
    }

    #[tokio::test]
    async fn lens_tools_pass_through_to_backend() {
        let (_, gateway) = gateway();
        let envelope = gateway
            .invoke_tool(
                TOOL_LENS_SET,
                &args(json!({ "profile": { "voice": "terse" } })),
                CLIENT,
            )
            .await;
        assert_eq!(envelope["status"], "ok");
        assert_eq!(envelope["result"]["op"], "set");
        assert_eq!(envelope["result"]["body"]["voice"], "terse");
    }
}
