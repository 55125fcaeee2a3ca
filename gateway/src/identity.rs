use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Tier tag rendered into externally exposed tool names.
///
/// Wire strings are a bit-exact contract: `tool` for directly callable
/// read-only capabilities, `run` for confirmation-gated mutating ones,
/// `playbook` for backend-declared macro workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierTag {
    Tool,
    Run,
    Playbook,
}

impl TierTag {
    pub const ALL: [TierTag; 3] = [TierTag::Tool, TierTag::Run, TierTag::Playbook];

    pub fn as_str(self) -> &'static str {
        match self {
            TierTag::Tool => "tool",
            TierTag::Run => "run",
            TierTag::Playbook => "playbook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tool" => Some(TierTag::Tool),
            "run" => Some(TierTag::Run),
            "playbook" => Some(TierTag::Playbook),
            _ => None,
        }
    }
}

/// Canonical identity of a capability: a pack plus an action within it.
///
/// `canonical()` is the only identifier ever sent to the backend; external
/// names are a rendering of this identity plus a tier tag and must invert
/// losslessly back to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityIdentity {
    /// Single lowercase token, `[a-z][a-z0-9]*`.
    pub pack: String,
    /// Lowercase snake_case, segments `[a-z0-9]+`.
    pub action: String,
}

impl CapabilityIdentity {
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.pack, self.action)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("pack is empty or not a valid token after normalization")]
    InvalidPack,
    #[error("action is empty after normalization")]
    InvalidAction,
    #[error("unknown pack '{pack}'")]
    UnknownPack { pack: String },
}

/// Known-pack set refreshed periodically from the backend catalog.
///
/// Strict pack validation only applies while the registry is fresh; a
/// stale or never-populated registry degrades resolution gracefully
/// rather than rejecting syntactically valid identities.
pub struct PackRegistry {
    inner: Mutex<PackRegistryState>,
    ttl: Duration,
}

struct PackRegistryState {
    packs: HashSet<String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl PackRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(PackRegistryState {
                packs: HashSet::new(),
                refreshed_at: None,
            }),
            ttl,
        }
    }

    pub fn replace(&self, packs: impl IntoIterator<Item = String>, now: DateTime<Utc>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.packs = packs.into_iter().collect();
        state.refreshed_at = Some(now);
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match state.refreshed_at {
            Some(at) => {
                now.signed_duration_since(at).num_seconds() <= self.ttl.as_secs() as i64
            }
            None => false,
        }
    }

    pub fn contains(&self, pack: &str) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.packs.contains(pack)
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.refreshed_at
    }
}

/// Resolves raw capability identifiers into canonical identities and
/// renders/parses the external three-tier tool names.
pub struct IdentityResolver {
    namespace: String,
    strict: bool,
    registry: PackRegistry,
}

impl IdentityResolver {
    pub fn new(namespace: String, strict: bool, registry_ttl: Duration) -> Self {
        Self {
            namespace,
            strict,
            registry: PackRegistry::new(registry_ttl),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry(&self) -> &PackRegistry {
        &self.registry
    }

    /// Normalizes a raw `(pack, action)` pair into a canonical identity.
    ///
    /// Unknown packs are rejected only when strict validation is enabled
    /// AND the registry is fresh; otherwise resolution degrades to the
    /// syntactic check alone.
    pub fn resolve(&self, raw_pack: &str, raw_action: &str) -> Result<CapabilityIdentity, IdentityError> {
        let pack = normalize_pack(raw_pack).ok_or(IdentityError::InvalidPack)?;
        let action = normalize_action(raw_action).ok_or(IdentityError::InvalidAction)?;
        let identity = CapabilityIdentity { pack, action };
        self.verify_pack(&identity)?;
        Ok(identity)
    }

    /// Strict-mode pack check, shared by `resolve` and the invoke path.
    /// A stale or empty registry passes everything (graceful degradation).
    pub fn verify_pack(&self, identity: &CapabilityIdentity) -> Result<(), IdentityError> {
        if self.strict
            && self.registry.is_fresh(Utc::now())
            && !self.registry.contains(&identity.pack)
        {
            return Err(IdentityError::UnknownPack {
                pack: identity.pack.clone(),
            });
        }
        Ok(())
    }

    /// Renders `{namespace}_{tag}_{pack}_{action}`.
    pub fn external_name(&self, tag: TierTag, identity: &CapabilityIdentity) -> String {
        format!(
            "{}_{}_{}_{}",
            self.namespace,
            tag.as_str(),
            identity.pack,
            identity.action
        )
    }

    /// Exact structural inverse of [`external_name`]. Returns `None` on
    /// any malformed input — this is called on untrusted external names.
    ///
    /// [`external_name`]: IdentityResolver::external_name
    pub fn parse_external_name(&self, name: &str) -> Option<(CapabilityIdentity, TierTag)> {
        let rest = name.strip_prefix(self.namespace.as_str())?;
        let rest = rest.strip_prefix('_')?;
        let (tag_raw, rest) = rest.split_once('_')?;
        let tag = TierTag::parse(tag_raw)?;
        let (pack, action) = rest.split_once('_')?;
        if !is_valid_pack(pack) || !is_valid_action(action) {
            return None;
        }
        Some((
            CapabilityIdentity {
                pack: pack.to_string(),
                action: action.to_string(),
            },
            tag,
        ))
    }
}

/// Packs are single tokens: lowercase the input and drop everything that
/// is not alphanumeric. The result must start with a letter.
fn normalize_pack(raw: &str) -> Option<String> {
    let pack: String = raw
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    if is_valid_pack(&pack) { Some(pack) } else { None }
}

/// Actions keep their word structure: lowercase, with runs of separators
/// collapsed to single underscores.
fn normalize_action(raw: &str) -> Option<String> {
    let mut action = String::with_capacity(raw.len());
    for c in raw.to_ascii_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            action.push(c);
        } else if !action.is_empty() && !action.ends_with('_') {
            action.push('_');
        }
    }
    while action.ends_with('_') {
        action.pop();
    }
    if is_valid_action(&action) { Some(action) } else { None }
}

fn is_valid_pack(pack: &str) -> bool {
    let mut chars = pack.chars();
    matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_valid_action(action: &str) -> bool {
    !action.is_empty()
        && action
            .split('_')
            .all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()))
}
