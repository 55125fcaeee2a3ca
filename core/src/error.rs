use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response — designed for agents, not humans.
/// Every error contains enough information for an agent to understand
/// what went wrong and how to fix it.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found", "access_denied")
    pub error: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
    /// Recommended client action identifier (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

/// Error codes used across the gateway
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const CONFIRMATION_REQUIRED: &str = "confirmation_required";
    pub const CONFIRMATION_REJECTED: &str = "confirmation_rejected";
    pub const WORKSPACE_UNRESOLVED: &str = "workspace_unresolved";
    pub const LEASE_NOT_HELD: &str = "lease_not_held";
    pub const LEASE_CEILING_EXCEEDED: &str = "lease_ceiling_exceeded";
    pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
}
