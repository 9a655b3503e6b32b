//! Serde mirror of the flow definition JSON.
//!
//! Field names follow the JSON contract (camelCase). Enumerations are closed,
//! so an unknown `onExhaust` or `importance` string fails to deserialize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{
    GateName, GoalKind, Importance, NodeId, OnExhaust, PromptVariantStrategy,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    #[serde(default)]
    pub entry_node_ids: Vec<NodeId>,
    pub primary_goal: GoalDefinition,
    #[serde(default)]
    pub gate_definitions: BTreeMap<GateName, GateDefinition>,
    /// Raw → canonical pairs in document order; repeated keys are kept so
    /// the builder can report each remap.
    #[serde(default, with = "alias_entries")]
    pub fact_aliases: Vec<(String, String)>,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Overrides merged into `nodes` by the builder before validation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_patches: BTreeMap<NodeId, NodePatch>,
}

/// `factAliases` as an ordered list of entries instead of a map.
mod alias_entries {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &[(String, String)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(entries.iter().map(|(raw, canonical)| (raw, canonical)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, String)>, D::Error> {
        struct Entries;

        impl<'de> Visitor<'de> for Entries {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of raw fact names to canonical fact names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, String>()? {
                    entries.push(entry);
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(Entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalDefinition {
    #[serde(rename = "type")]
    pub kind: GoalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDefinition {
    #[serde(default)]
    pub satisfied_by: RuleDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_all: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_any: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_all: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<Produces>,
    #[serde(default)]
    pub config: NodeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Canonical facts that must be known (alias-resolved at compile time).
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub gates: Vec<GateName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Produces {
    #[serde(default)]
    pub facts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicyDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_states: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfies: Option<Satisfies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,
}

impl NodeConfig {
    /// Field-wise merge: every field set in `patch` wins.
    pub fn merged(&self, patch: &NodeConfig) -> NodeConfig {
        NodeConfig {
            run_policy: patch.run_policy.or(self.run_policy),
            retry_policy: match (&self.retry_policy, &patch.retry_policy) {
                (Some(base), Some(over)) => Some(base.merged(over)),
                (base, over) => over.or(*base),
            },
            requires_states: patch
                .requires_states
                .clone()
                .or_else(|| self.requires_states.clone()),
            satisfies: patch.satisfies.clone().or_else(|| self.satisfies.clone()),
            importance: patch.importance.or(self.importance),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicyDefinition {
    /// Absent or `null` means unbounded.
    #[serde(default)]
    pub max_executions: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exhaust: Option<OnExhaust>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_variant_strategy: Option<PromptVariantStrategy>,
}

impl RetryPolicyDefinition {
    pub fn merged(&self, patch: &RetryPolicyDefinition) -> RetryPolicyDefinition {
        RetryPolicyDefinition {
            max_attempts: patch.max_attempts.or(self.max_attempts),
            on_exhaust: patch.on_exhaust.or(self.on_exhaust),
            cooldown_turns: patch.cooldown_turns.or(self.cooldown_turns),
            prompt_variant_strategy: patch
                .prompt_variant_strategy
                .or(self.prompt_variant_strategy),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Satisfies {
    #[serde(default)]
    pub gates: Vec<GateName>,
    #[serde(default)]
    pub states: Vec<String>,
}

/// Partial override for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<Produces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<NodeConfig>,
}

impl NodeDefinition {
    /// Return a new definition with `patch` applied.
    pub fn patched(&self, patch: &NodePatch) -> NodeDefinition {
        NodeDefinition {
            id: self.id.clone(),
            kind: self.kind.clone(),
            title: patch.title.clone().unwrap_or_else(|| self.title.clone()),
            requires: patch.requires.clone().or_else(|| self.requires.clone()),
            produces: patch.produces.clone().or_else(|| self.produces.clone()),
            config: match &patch.config {
                Some(config) => self.config.merged(config),
                None => self.config.clone(),
            },
        }
    }
}

/// Fluent constructors for programmatic flows (tests, scenario fixtures).
impl NodeDefinition {
    pub fn new(id: impl Into<NodeId>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            kind: "step".to_string(),
            id,
            ..Self::default()
        }
    }

    pub fn requires_gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires
            .get_or_insert_with(Requirements::default)
            .gates
            .extend(gates.into_iter().map(Into::into));
        self
    }

    pub fn requires_facts<I, S>(mut self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires
            .get_or_insert_with(Requirements::default)
            .facts
            .extend(facts.into_iter().map(Into::into));
        self
    }

    pub fn requires_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .requires_states
            .get_or_insert_with(Vec::new)
            .extend(states.into_iter().map(Into::into));
        self
    }

    pub fn produces<I, S>(mut self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces
            .get_or_insert_with(Produces::default)
            .facts
            .extend(facts.into_iter().map(Into::into));
        self
    }

    pub fn satisfies_gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .satisfies
            .get_or_insert_with(Satisfies::default)
            .gates
            .extend(gates.into_iter().map(Into::into));
        self
    }

    pub fn satisfies_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .satisfies
            .get_or_insert_with(Satisfies::default)
            .states
            .extend(states.into_iter().map(Into::into));
        self
    }

    pub fn max_executions(mut self, max: u32) -> Self {
        self.config.run_policy = Some(RunPolicyDefinition {
            max_executions: Some(max),
        });
        self
    }

    pub fn retry(mut self, max_attempts: u32, on_exhaust: OnExhaust) -> Self {
        let retry = self
            .config
            .retry_policy
            .get_or_insert_with(RetryPolicyDefinition::default);
        retry.max_attempts = Some(max_attempts);
        retry.on_exhaust = Some(on_exhaust);
        self
    }

    pub fn cooldown(mut self, turns: u32) -> Self {
        self.config
            .retry_policy
            .get_or_insert_with(RetryPolicyDefinition::default)
            .cooldown_turns = Some(turns);
        self
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.config.importance = Some(importance);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTACT_JSON: &str = r#"{
        "entryNodeIds": ["contact-1"],
        "primaryGoal": { "type": "GATE", "gate": "CONTACT", "description": "collect contact" },
        "gateDefinitions": {
            "CONTACT": { "satisfiedBy": { "metricsAny": ["contact_email", "contact_phone"] } }
        },
        "factAliases": { "email": "contact_email" },
        "nodes": [
            {
                "id": "contact-1",
                "type": "question",
                "title": "Ask for contact",
                "produces": { "facts": ["email"] },
                "config": {
                    "retryPolicy": { "maxAttempts": 2, "onExhaust": "BROADEN" },
                    "satisfies": { "gates": ["CONTACT"] },
                    "importance": "HIGH"
                }
            }
        ]
    }"#;

    #[test]
    fn parses_json_contract() {
        let def: FlowDefinition = serde_json::from_str(CONTACT_JSON).expect("parse");
        assert_eq!(def.entry_node_ids, vec!["contact-1".to_string()]);
        assert_eq!(def.primary_goal.kind, GoalKind::Gate);
        let node = &def.nodes[0];
        assert_eq!(node.kind, "question");
        let retry = node.config.retry_policy.expect("retry");
        assert_eq!(retry.max_attempts, Some(2));
        assert_eq!(retry.on_exhaust, Some(OnExhaust::Broaden));
        assert_eq!(node.config.importance, Some(Importance::High));
    }

    #[test]
    fn repeated_alias_keys_are_all_kept() {
        let json = CONTACT_JSON.replace(
            r#""factAliases": { "email": "contact_email" }"#,
            r#""factAliases": {
                "email": "contact_email", "phone": "contact_phone", "email": "work_email"
            }"#,
        );
        let def: FlowDefinition = serde_json::from_str(&json).expect("parse");
        assert_eq!(
            def.fact_aliases,
            vec![
                ("email".to_string(), "contact_email".to_string()),
                ("phone".to_string(), "contact_phone".to_string()),
                ("email".to_string(), "work_email".to_string()),
            ]
        );
        let out = serde_json::to_value(&def).expect("serialize");
        assert_eq!(out["factAliases"]["phone"], "contact_phone");
    }

    #[test]
    fn rejects_unknown_on_exhaust() {
        let bad = CONTACT_JSON.replace("\"BROADEN\"", "\"WHATEVER\"");
        assert!(serde_json::from_str::<FlowDefinition>(&bad).is_err());
    }

    /// Patches override only the fields they set.
    #[test]
    fn patch_merges_field_wise() {
        let def: FlowDefinition = serde_json::from_str(CONTACT_JSON).expect("parse");
        let patch = NodePatch {
            config: Some(NodeConfig {
                retry_policy: Some(RetryPolicyDefinition {
                    cooldown_turns: Some(2),
                    ..RetryPolicyDefinition::default()
                }),
                ..NodeConfig::default()
            }),
            ..NodePatch::default()
        };
        let patched = def.nodes[0].patched(&patch);
        let retry = patched.config.retry_policy.expect("retry");
        assert_eq!(retry.max_attempts, Some(2));
        assert_eq!(retry.cooldown_turns, Some(2));
        assert_eq!(patched.config.importance, Some(Importance::High));
        assert_eq!(patched.title, "Ask for contact");
    }
}
