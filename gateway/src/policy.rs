use regex::Regex;

use crate::identity::TierTag;

/// Access classification of an externally exposed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTier {
    /// Read-only, directly callable.
    Primitive,
    /// Mutating, confirmation-gated.
    Governed,
    /// Never exposed.
    Internal,
}

impl AccessTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessTier::Primitive => "primitive",
            AccessTier::Governed => "governed",
            AccessTier::Internal => "internal",
        }
    }
}

/// Execution constraints attached to an access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraints {
    pub requires_confirmation: bool,
    pub requires_preview: bool,
    pub max_calls_per_minute: Option<u32>,
}

impl Constraints {
    pub fn read_only(max_calls_per_minute: u32) -> Self {
        Self {
            requires_confirmation: false,
            requires_preview: false,
            max_calls_per_minute: Some(max_calls_per_minute),
        }
    }

    pub fn confirm(max_calls_per_minute: u32) -> Self {
        Self {
            requires_confirmation: true,
            requires_preview: false,
            max_calls_per_minute: Some(max_calls_per_minute),
        }
    }

    pub fn confirm_with_preview(max_calls_per_minute: u32) -> Self {
        Self {
            requires_confirmation: true,
            requires_preview: true,
            max_calls_per_minute: Some(max_calls_per_minute),
        }
    }
}

/// The classification result for one name. Every name gets exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub tier: AccessTier,
    pub reason: String,
    pub constraints: Constraints,
}

/// How a rule matches a name.
///
/// Built-in rules use the structural variants; environment-specific custom
/// rules may additionally use full regex patterns.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Substring match anywhere in the name.
    Fragment(Vec<&'static str>),
    /// Exact match against any underscore-separated segment of the name.
    Segment(Vec<&'static str>),
    /// The name's tier-tag position (second segment) equals the tag.
    Tag(TierTag),
    /// Full regex match, for custom rules.
    Pattern(Regex),
}

impl RuleMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            RuleMatcher::Fragment(fragments) => {
                fragments.iter().any(|fragment| name.contains(fragment))
            }
            RuleMatcher::Segment(verbs) => name
                .split('_')
                .any(|segment| verbs.iter().any(|verb| segment == *verb)),
            RuleMatcher::Tag(tag) => name.split('_').nth(1) == Some(tag.as_str()),
            RuleMatcher::Pattern(pattern) => pattern.is_match(name),
        }
    }
}

/// One ordered classification rule.
#[derive(Debug, Clone)]
pub struct AccessRule {
    pub matcher: RuleMatcher,
    pub tier: AccessTier,
    pub reason: String,
    pub constraints: Constraints,
}

/// Ordered first-match-wins rule list with a mandatory catch-all.
///
/// The catch-all is a separate struct field rather than the last vector
/// element, so "every name classifies" holds by construction — there is
/// no way to build a policy without it.
pub struct AccessPolicy {
    custom: Vec<AccessRule>,
    builtin: Vec<AccessRule>,
    fallback: AccessRule,
}

impl AccessPolicy {
    /// Built-in rule set, ordered most-specific first. Naive ordering
    /// here silently misclassifies destructive operations as safe; the
    /// precedence is load-bearing and covered by tests.
    pub fn with_defaults(primitive_rate: u32, governed_rate: u32) -> Self {
        let builtin = vec![
            AccessRule {
                matcher: RuleMatcher::Fragment(vec![
                    "admin",
                    "debug",
                    "internal",
                    "migrate",
                    "migration",
                    "diagnostic",
                ]),
                tier: AccessTier::Internal,
                reason: "administrative or diagnostic operation".to_string(),
                constraints: Constraints::default(),
            },
            AccessRule {
                matcher: RuleMatcher::Segment(vec![
                    "delete", "remove", "drop", "truncate", "purge", "destroy", "wipe",
                ]),
                tier: AccessTier::Governed,
                reason: "destructive operation".to_string(),
                constraints: Constraints::confirm_with_preview(governed_rate),
            },
            AccessRule {
                matcher: RuleMatcher::Segment(vec![
                    "bulk", "batch", "publish", "deploy", "overwrite", "reset", "rotate",
                    "revoke",
                ]),
                tier: AccessTier::Governed,
                reason: "bulk or irreversible operation".to_string(),
                constraints: Constraints::confirm(governed_rate),
            },
            AccessRule {
                matcher: RuleMatcher::Segment(vec![
                    "create", "update", "set", "write", "send", "post", "merge", "apply",
                    "import", "archive", "restore", "move", "rename",
                ]),
                tier: AccessTier::Governed,
                reason: "state-mutating operation".to_string(),
                constraints: Constraints::confirm(governed_rate),
            },
            AccessRule {
                matcher: RuleMatcher::Segment(vec![
                    "get", "list", "read", "query", "search", "find", "validate", "status",
                    "describe", "count", "check", "preview", "export",
                ]),
                tier: AccessTier::Primitive,
                reason: "read-only operation".to_string(),
                constraints: Constraints::read_only(primitive_rate),
            },
            AccessRule {
                matcher: RuleMatcher::Tag(TierTag::Playbook),
                tier: AccessTier::Governed,
                reason: "macro workflow composes effects of unknown scope".to_string(),
                constraints: Constraints::confirm(governed_rate),
            },
        ];
        let fallback = AccessRule {
            matcher: RuleMatcher::Fragment(vec![""]),
            tier: AccessTier::Governed,
            reason: "unclassified operation defaults to governed".to_string(),
            constraints: Constraints::confirm(governed_rate),
        };
        Self {
            custom: Vec::new(),
            builtin,
            fallback,
        }
    }

    /// Inserts a custom rule ahead of everything already present — the
    /// new rule takes highest precedence. Built-ins are never touched,
    /// so custom rules can tighten but defaults stay intact.
    pub fn push_front(&mut self, rule: AccessRule) {
        self.custom.insert(0, rule);
    }

    /// Classifies a name: custom rules, then built-ins, then the
    /// catch-all. First match wins.
    pub fn classify(&self, name: &str) -> AccessDecision {
        let matched = self
            .custom
            .iter()
            .chain(self.builtin.iter())
            .find(|rule| rule.matcher.matches(name))
            .unwrap_or(&self.fallback);
        AccessDecision {
            allowed: matched.tier != AccessTier::Internal,
            tier: matched.tier,
            reason: matched.reason.clone(),
            constraints: matched.constraints,
        }
    }
}
