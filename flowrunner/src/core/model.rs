//! Compiled, immutable flow model.
//!
//! A `FlowModel` is produced once per flow version by [`crate::flow::FlowBuilder`]
//! and then shared read-only (typically behind an `Arc`) by every run of that
//! version. Gate definitions and aliases are owned by the model and passed into
//! every pure function; there is no global registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::types::{
    FactName, GateName, GoalKind, Importance, NodeId, OnExhaust, PromptVariantStrategy, StateName,
};

/// Satisfaction rule for a gate. Absent groups are not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SatisfactionRule {
    pub metrics_all: Option<BTreeSet<FactName>>,
    pub metrics_any: Option<BTreeSet<FactName>>,
    pub states_all: Option<BTreeSet<StateName>>,
}

impl SatisfactionRule {
    /// True when no rule group is present (vacuously satisfied).
    pub fn is_empty(&self) -> bool {
        self.metrics_all.is_none() && self.metrics_any.is_none() && self.states_all.is_none()
    }
}

/// Completion predicate for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryGoal {
    pub kind: GoalKind,
    /// Gate name for `GoalKind::Gate`, state name for `GoalKind::State`.
    pub target: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunPolicy {
    /// `None` means unbounded.
    pub max_executions: Option<u32>,
}

impl RunPolicy {
    pub fn allows(&self, executions: u32) -> bool {
        self.max_executions.is_none_or(|max| executions < max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub on_exhaust: OnExhaust,
    pub cooldown_turns: u32,
    pub prompt_variant_strategy: PromptVariantStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            on_exhaust: OnExhaust::default(),
            cooldown_turns: 0,
            prompt_variant_strategy: PromptVariantStrategy::default(),
        }
    }
}

/// A compiled conversational step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDef {
    pub id: NodeId,
    pub kind: String,
    pub title: String,
    /// Position in the flow definition; the last tie-breaker during selection.
    pub order: usize,
    pub requires_gates: BTreeSet<GateName>,
    pub requires_states: BTreeSet<StateName>,
    /// Canonical facts that must be known before the node is eligible.
    pub requires_facts: BTreeSet<FactName>,
    /// Raw fact names the node's extraction step may assert.
    pub produces_facts: BTreeSet<FactName>,
    pub satisfies_gates: BTreeSet<GateName>,
    pub satisfies_states: BTreeSet<StateName>,
    pub run_policy: RunPolicy,
    pub retry_policy: RetryPolicy,
    pub importance: Importance,
}

impl NodeDef {
    /// True when the node declares at least one gate or state it accomplishes.
    pub fn has_objective(&self) -> bool {
        !self.satisfies_gates.is_empty() || !self.satisfies_states.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowModel {
    version: String,
    entry_node_ids: Vec<NodeId>,
    primary_goal: PrimaryGoal,
    gate_definitions: BTreeMap<GateName, SatisfactionRule>,
    fact_aliases: BTreeMap<FactName, FactName>,
    nodes: Vec<NodeDef>,
    index: HashMap<NodeId, usize>,
}

impl FlowModel {
    /// Assemble a model from already-validated parts.
    pub(crate) fn new(
        version: String,
        entry_node_ids: Vec<NodeId>,
        primary_goal: PrimaryGoal,
        gate_definitions: BTreeMap<GateName, SatisfactionRule>,
        fact_aliases: BTreeMap<FactName, FactName>,
        nodes: Vec<NodeDef>,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id.clone(), idx))
            .collect();
        Self {
            version,
            entry_node_ids,
            primary_goal,
            gate_definitions,
            fact_aliases,
            nodes,
            index,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn entry_node_ids(&self) -> &[NodeId] {
        &self.entry_node_ids
    }

    pub fn is_entry(&self, id: &str) -> bool {
        self.entry_node_ids.iter().any(|entry| entry == id)
    }

    pub fn primary_goal(&self) -> &PrimaryGoal {
        &self.primary_goal
    }

    pub fn gate(&self, name: &str) -> Option<&SatisfactionRule> {
        self.gate_definitions.get(name)
    }

    pub fn gates(&self) -> impl Iterator<Item = (&GateName, &SatisfactionRule)> {
        self.gate_definitions.iter()
    }

    /// Canonical name for a raw fact, if an alias exists.
    pub fn alias(&self, raw: &str) -> Option<&str> {
        self.fact_aliases.get(raw).map(String::as_str)
    }

    pub fn fact_aliases(&self) -> &BTreeMap<FactName, FactName> {
        &self.fact_aliases
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.index.get(id).map(|idx| &self.nodes[*idx])
    }
}
