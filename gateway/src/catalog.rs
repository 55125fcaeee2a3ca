use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::identity::{IdentityResolver, TierTag};
use crate::policy::{AccessDecision, AccessPolicy, AccessTier};

/// Reserved pack for backend workflows declared without one.
pub const WORKFLOW_DEFAULT_PACK: &str = "flows";

/// Backend catalog wire shape.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub packs: Vec<CatalogPack>,
    #[serde(default)]
    pub workflows: Vec<CatalogWorkflow>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogPack {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<CatalogAction>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogAction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// A backend-declared macro workflow (multi-step orchestration).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogWorkflow {
    pub name: String,
    #[serde(default)]
    pub pack: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A catalog entry projected into the externally exposed tool shape.
#[derive(Debug, Clone)]
pub struct MappedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub tag: TierTag,
    pub decision: AccessDecision,
}

/// Projects the backend catalog into exposed tools: build identities,
/// classify, drop internal, render the tier-matching name, attach
/// decision metadata. Entries that fail identity resolution are skipped
/// (and logged), never exposed half-formed.
pub fn map_catalog(
    catalog: &CatalogResponse,
    resolver: &IdentityResolver,
    policy: &AccessPolicy,
) -> Vec<MappedTool> {
    let mut tools = Vec::new();

    for pack in &catalog.packs {
        for action in &pack.actions {
            let Ok(identity) = resolver.resolve(&pack.name, &action.name) else {
                tracing::warn!(
                    event = "catalog_entry_skipped",
                    pack = %pack.name,
                    action = %action.name,
                    "catalog entry failed identity resolution"
                );
                continue;
            };
            // Classification happens on the rendered name; the provisional
            // tag has no bearing on which rule matches (rules key on
            // fragments and action segments), so render once, classify,
            // then re-render with the tier-matching tag.
            let provisional = resolver.external_name(TierTag::Tool, &identity);
            let decision = policy.classify(&provisional);
            let tag = match decision.tier {
                AccessTier::Internal => continue,
                AccessTier::Primitive => TierTag::Tool,
                AccessTier::Governed => TierTag::Run,
            };
            let name = resolver.external_name(tag, &identity);
            tools.push(MappedTool {
                description: describe(action.description.as_deref(), &decision),
                input_schema: action
                    .input_schema
                    .clone()
                    .unwrap_or_else(permissive_schema),
                name,
                tag,
                decision,
            });
        }
    }

    for workflow in &catalog.workflows {
        let pack = workflow.pack.as_deref().unwrap_or(WORKFLOW_DEFAULT_PACK);
        let Ok(identity) = resolver.resolve(pack, &workflow.name) else {
            tracing::warn!(
                event = "catalog_entry_skipped",
                pack,
                workflow = %workflow.name,
                "workflow failed identity resolution"
            );
            continue;
        };
        let name = resolver.external_name(TierTag::Playbook, &identity);
        let decision = policy.classify(&name);
        if decision.tier == AccessTier::Internal {
            continue;
        }
        tools.push(MappedTool {
            description: describe(workflow.description.as_deref(), &decision),
            input_schema: permissive_schema(),
            name,
            tag: TierTag::Playbook,
            decision,
        });
    }

    tools.sort_by(|a, b| a.name.cmp(&b.name));
    tools
}

fn describe(description: Option<&str>, decision: &AccessDecision) -> String {
    let base = description.unwrap_or("Backend capability.").trim();
    if decision.constraints.requires_preview {
        format!("{base} Requires confirmation with an action preview.")
    } else if decision.constraints.requires_confirmation {
        format!("{base} Requires confirmation.")
    } else {
        base.to_string()
    }
}

fn permissive_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixtures() -> (IdentityResolver, AccessPolicy) {
        (
            IdentityResolver::new("relay".to_string(), false, Duration::from_secs(300)),
            AccessPolicy::with_defaults(120, 30),
        )
    }

    fn catalog() -> CatalogResponse {
        CatalogResponse {
            packs: vec![CatalogPack {
                name: "notes".to_string(),
                actions: vec![
                    CatalogAction {
                        name: "search".to_string(),
                        description: Some("Full-text search over notes.".to_string()),
                        input_schema: Some(json!({
                            "type": "object",
                            "properties": { "query": { "type": "string" } },
                            "required": ["query"]
                        })),
                    },
                    CatalogAction {
                        name: "delete archive".to_string(),
                        description: None,
                        input_schema: None,
                    },
                    CatalogAction {
                        name: "admin reindex".to_string(),
                        description: None,
                        input_schema: None,
                    },
                ],
            }],
            workflows: vec![CatalogWorkflow {
                name: "weekly digest".to_string(),
                pack: None,
                description: Some("Compiles and sends the weekly digest.".to_string()),
            }],
        }
    }

    #[test]
    fn read_only_actions_map_to_tool_tier() {
        let (resolver, policy) = fixtures();
        let tools = map_catalog(&catalog(), &resolver, &policy);
        let search = tools
            .iter()
            .find(|tool| tool.name == "relay_tool_notes_search")
            .expect("search tool must be exposed");
        assert_eq!(search.tag, TierTag::Tool);
        assert!(!search.decision.constraints.requires_confirmation);
        assert_eq!(search.input_schema["required"][0], "query");
    }

    #[test]
    fn destructive_actions_map_to_run_tier_with_annotation() {
        let (resolver, policy) = fixtures();
        let tools = map_catalog(&catalog(), &resolver, &policy);
        let delete = tools
            .iter()
            .find(|tool| tool.name == "relay_run_notes_delete_archive")
            .expect("delete tool must be exposed under run tier");
        assert_eq!(delete.tag, TierTag::Run);
        assert!(delete.decision.constraints.requires_confirmation);
        assert!(delete.description.contains("action preview"));
    }

    #[test]
    fn internal_actions_are_dropped() {
        let (resolver, policy) = fixtures();
        let tools = map_catalog(&catalog(), &resolver, &policy);
        assert!(
            tools.iter().all(|tool| !tool.name.contains("admin")),
            "internal entries must never be exposed"
        );
    }

    #[test]
    fn workflows_map_to_playbooks_under_the_default_pack() {
        let (resolver, policy) = fixtures();
        let tools = map_catalog(&catalog(), &resolver, &policy);
        let digest = tools
            .iter()
            .find(|tool| tool.name == "relay_playbook_flows_weekly_digest")
            .expect("workflow must be exposed as a playbook");
        assert_eq!(digest.tag, TierTag::Playbook);
        assert!(digest.decision.constraints.requires_confirmation);
    }

    #[test]
    fn every_exposed_name_parses_back() {
        let (resolver, policy) = fixtures();
        for tool in map_catalog(&catalog(), &resolver, &policy) {
            let parsed = resolver.parse_external_name(&tool.name);
            assert!(parsed.is_some(), "unparseable exposed name: {}", tool.name);
            assert_eq!(parsed.map(|(_, tag)| tag), Some(tool.tag));
        }
    }
}
