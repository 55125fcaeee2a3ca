use std::time::Duration;

pub const NAMESPACE_ENV: &str = "RELAY_TOOL_NAMESPACE";
pub const STRICT_PACKS_ENV: &str = "RELAY_STRICT_PACKS";
pub const CONFIRM_TTL_ENV: &str = "RELAY_CONFIRM_TTL_SECS";
pub const ACK_LEASE_ENV: &str = "RELAY_DISPATCH_ACK_LEASE_SECS";
pub const LEASE_CEILING_ENV: &str = "RELAY_DISPATCH_LEASE_CEILING_SECS";
pub const RETENTION_ENV: &str = "RELAY_DISPATCH_RETENTION_SECS";
pub const PACK_REGISTRY_TTL_ENV: &str = "RELAY_PACK_REGISTRY_TTL_SECS";
pub const PRIMITIVE_RATE_ENV: &str = "RELAY_PRIMITIVE_CALLS_PER_MINUTE";
pub const GOVERNED_RATE_ENV: &str = "RELAY_GOVERNED_CALLS_PER_MINUTE";
pub const BACKEND_CONNECT_TIMEOUT_ENV: &str = "RELAY_BACKEND_CONNECT_TIMEOUT_SECS";
pub const BACKEND_REQUEST_TIMEOUT_ENV: &str = "RELAY_BACKEND_REQUEST_TIMEOUT_SECS";

const DEFAULT_NAMESPACE: &str = "relay";
const DEFAULT_CONFIRM_TTL_SECS: u64 = 300;
const DEFAULT_ACK_LEASE_SECS: u64 = 600;
const DEFAULT_LEASE_CEILING_SECS: u64 = 2_700;
const DEFAULT_RETENTION_SECS: u64 = 3_600;
const DEFAULT_PACK_REGISTRY_TTL_SECS: u64 = 300;
const DEFAULT_PRIMITIVE_CALLS_PER_MINUTE: u32 = 120;
const DEFAULT_GOVERNED_CALLS_PER_MINUTE: u32 = 30;
const DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bounds for per-request dispatch parameters. Requests outside the bounds
/// are clamped, not rejected.
pub const LEASE_SECONDS_MIN: u64 = 5;
pub const LEASE_SECONDS_MAX: u64 = 120;
pub const LEASE_SECONDS_DEFAULT: u64 = 30;
pub const WAIT_SECONDS_MAX: u64 = 30;
pub const NEXT_LIMIT_MIN: usize = 1;
pub const NEXT_LIMIT_MAX: usize = 10;

/// Runtime configuration for the gateway, resolved once at startup.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Namespace prefix for externally exposed tool names.
    pub namespace: String,
    /// Reject unknown packs when the pack registry is fresh.
    pub strict_packs: bool,
    pub confirm_ttl: Duration,
    pub pack_registry_ttl: Duration,
    pub dispatch: DispatchConfig,
    pub primitive_calls_per_minute: u32,
    pub governed_calls_per_minute: u32,
    pub backend_connect_timeout: Duration,
    pub backend_request_timeout: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Lease window granted by `ack` and refreshed by `progress`.
    pub ack_lease_secs: u64,
    /// Hard ceiling on cumulative granted lease seconds per task.
    pub lease_ceiling_secs: u64,
    /// How long terminal records are retained for idempotent replays.
    pub retention_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_lease_secs: DEFAULT_ACK_LEASE_SECS,
            lease_ceiling_secs: DEFAULT_LEASE_CEILING_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            strict_packs: false,
            confirm_ttl: Duration::from_secs(DEFAULT_CONFIRM_TTL_SECS),
            pack_registry_ttl: Duration::from_secs(DEFAULT_PACK_REGISTRY_TTL_SECS),
            dispatch: DispatchConfig::default(),
            primitive_calls_per_minute: DEFAULT_PRIMITIVE_CALLS_PER_MINUTE,
            governed_calls_per_minute: DEFAULT_GOVERNED_CALLS_PER_MINUTE,
            backend_connect_timeout: Duration::from_secs(DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS),
            backend_request_timeout: Duration::from_secs(DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl GatewayConfig {
    /// Resolves configuration from `RELAY_*` environment variables,
    /// clamping out-of-range values to safe bounds.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let namespace = parse_namespace(std::env::var(NAMESPACE_ENV).ok())
            .unwrap_or_else(|| defaults.namespace.clone());
        let (confirm_ttl_secs, _) = parse_env_u64_with_bounds(
            std::env::var(CONFIRM_TTL_ENV).ok(),
            30,
            1_800,
            DEFAULT_CONFIRM_TTL_SECS,
        );
        let (ack_lease_secs, _) = parse_env_u64_with_bounds(
            std::env::var(ACK_LEASE_ENV).ok(),
            60,
            1_800,
            DEFAULT_ACK_LEASE_SECS,
        );
        let (lease_ceiling_secs, _) = parse_env_u64_with_bounds(
            std::env::var(LEASE_CEILING_ENV).ok(),
            300,
            14_400,
            DEFAULT_LEASE_CEILING_SECS,
        );
        let (retention_secs, _) = parse_env_u64_with_bounds(
            std::env::var(RETENTION_ENV).ok(),
            60,
            86_400,
            DEFAULT_RETENTION_SECS,
        );
        let (pack_registry_ttl_secs, _) = parse_env_u64_with_bounds(
            std::env::var(PACK_REGISTRY_TTL_ENV).ok(),
            10,
            3_600,
            DEFAULT_PACK_REGISTRY_TTL_SECS,
        );
        let (primitive_calls_per_minute, _) = parse_env_u32_with_bounds(
            std::env::var(PRIMITIVE_RATE_ENV).ok(),
            1,
            6_000,
            DEFAULT_PRIMITIVE_CALLS_PER_MINUTE,
        );
        let (governed_calls_per_minute, _) = parse_env_u32_with_bounds(
            std::env::var(GOVERNED_RATE_ENV).ok(),
            1,
            600,
            DEFAULT_GOVERNED_CALLS_PER_MINUTE,
        );
        let (backend_connect_timeout_secs, _) = parse_env_u64_with_bounds(
            std::env::var(BACKEND_CONNECT_TIMEOUT_ENV).ok(),
            1,
            60,
            DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS,
        );
        let (backend_request_timeout_secs, _) = parse_env_u64_with_bounds(
            std::env::var(BACKEND_REQUEST_TIMEOUT_ENV).ok(),
            1,
            300,
            DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS,
        );

        Self {
            namespace,
            strict_packs: parse_env_bool_flag(std::env::var(STRICT_PACKS_ENV).ok(), false),
            confirm_ttl: Duration::from_secs(confirm_ttl_secs),
            pack_registry_ttl: Duration::from_secs(pack_registry_ttl_secs),
            dispatch: DispatchConfig {
                ack_lease_secs,
                lease_ceiling_secs,
                retention_secs,
            },
            primitive_calls_per_minute,
            governed_calls_per_minute,
            backend_connect_timeout: Duration::from_secs(backend_connect_timeout_secs),
            backend_request_timeout: Duration::from_secs(backend_request_timeout_secs),
        }
    }
}

pub(crate) fn parse_env_bool_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

pub(crate) fn parse_env_u64_with_bounds(
    raw: Option<String>,
    min: u64,
    max: u64,
    default: u64,
) -> (u64, bool) {
    match raw.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

pub(crate) fn parse_env_u32_with_bounds(
    raw: Option<String>,
    min: u32,
    max: u32,
    default: u32,
) -> (u32, bool) {
    match raw.and_then(|value| value.trim().parse::<u32>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

/// Namespace must be a single lowercase token — it becomes the first
/// underscore-separated segment of every exposed tool name.
fn parse_namespace(raw: Option<String>) -> Option<String> {
    let value = raw?.trim().to_ascii_lowercase();
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if valid { Some(value) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_flag_accepts_common_truthy_spellings() {
        assert!(parse_env_bool_flag(Some("1".to_string()), false));
        assert!(parse_env_bool_flag(Some("TRUE".to_string()), false));
        assert!(parse_env_bool_flag(Some("on".to_string()), false));
        assert!(!parse_env_bool_flag(Some("off".to_string()), true));
        assert!(parse_env_bool_flag(None, true));
    }

    #[test]
    fn u64_parsing_clamps_to_bounds() {
        assert_eq!(
            parse_env_u64_with_bounds(Some("999999".to_string()), 30, 1800, 300),
            (1800, true)
        );
        assert_eq!(
            parse_env_u64_with_bounds(Some("1".to_string()), 30, 1800, 300),
            (30, true)
        );
        assert_eq!(
            parse_env_u64_with_bounds(Some("nonsense".to_string()), 30, 1800, 300),
            (300, false)
        );
        assert_eq!(parse_env_u64_with_bounds(None, 30, 1800, 300), (300, false));
    }

    #[test]
    fn namespace_must_be_a_single_lowercase_token() {
        assert_eq!(parse_namespace(Some("Relay".to_string())), Some("relay".to_string()));
        assert_eq!(parse_namespace(Some("gw2".to_string())), Some("gw2".to_string()));
        assert_eq!(parse_namespace(Some("my_ns".to_string())), None);
        assert_eq!(parse_namespace(Some("2fast".to_string())), None);
        assert_eq!(parse_namespace(Some("".to_string())), None);
    }
}
