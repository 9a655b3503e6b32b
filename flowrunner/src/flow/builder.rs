//! Reducer that compiles flow definitions into an immutable [`FlowModel`].
//!
//! Patches are merged into a fresh copy of the base nodes; nothing shared is
//! mutated. Every fatal problem found in one pass is collected into
//! [`CompileErrors`] so authors can fix a flow in one edit cycle.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::core::facts::is_valid_fact_name;
use crate::core::model::{
    FlowModel, NodeDef, PrimaryGoal, RetryPolicy, RunPolicy, SatisfactionRule,
};
use crate::core::types::{FactName, GateName, GoalKind, NodeId};
use crate::error::{CompileError, CompileErrors};
use crate::flow::definition::{
    FlowDefinition, GoalDefinition, NodeDefinition, NodePatch, RuleDefinition,
};

/// Version assigned when the caller does not supply one.
pub const DEFAULT_VERSION: &str = "unversioned";

/// Non-fatal modeling problems. The flow still compiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileWarning {
    /// Gate with no rule groups; it is satisfied from the first turn.
    EmptyGateRule { gate: GateName },
    /// The same raw fact was aliased twice; the later mapping wins.
    AliasCollision {
        raw: FactName,
        previous: FactName,
        replacement: FactName,
    },
    /// Gate is defined but no node or goal refers to it.
    UnreachableGate { gate: GateName },
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileWarning::EmptyGateRule { gate } => {
                write!(f, "gate '{gate}' has no satisfaction rule and is always satisfied")
            }
            CompileWarning::AliasCollision {
                raw,
                previous,
                replacement,
            } => write!(
                f,
                "alias '{raw}' remapped from '{previous}' to '{replacement}'"
            ),
            CompileWarning::UnreachableGate { gate } => {
                write!(f, "gate '{gate}' is never referenced by a node or the goal")
            }
        }
    }
}

/// Successful compilation output.
#[derive(Debug, Clone)]
pub struct CompileReport {
    pub model: FlowModel,
    pub warnings: Vec<CompileWarning>,
}

#[derive(Debug, Clone, Default)]
pub struct FlowBuilder {
    version: Option<String>,
    entry_node_ids: Vec<NodeId>,
    goal: Option<GoalDefinition>,
    gates: BTreeMap<GateName, RuleDefinition>,
    aliases: BTreeMap<FactName, FactName>,
    nodes: Vec<NodeDefinition>,
    patches: Vec<(NodeId, NodePatch)>,
    warnings: Vec<CompileWarning>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from a parsed definition, including its `nodePatches`.
    pub fn from_definition(definition: FlowDefinition) -> Self {
        let mut builder = Self::new();
        builder.entry_node_ids = definition.entry_node_ids;
        builder.goal = Some(definition.primary_goal);
        for (name, gate) in definition.gate_definitions {
            builder = builder.gate(name, gate.satisfied_by);
        }
        for (raw, canonical) in definition.fact_aliases {
            builder = builder.alias(raw, canonical);
        }
        builder.nodes = definition.nodes;
        builder.patches = definition.node_patches.into_iter().collect();
        builder
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn entry(mut self, node: impl Into<NodeId>) -> Self {
        self.entry_node_ids.push(node.into());
        self
    }

    pub fn goal(mut self, kind: GoalKind, target: impl Into<String>) -> Self {
        let target = target.into();
        let (gate, state) = match kind {
            GoalKind::Gate => (Some(target), None),
            GoalKind::State => (None, Some(target)),
        };
        self.goal = Some(GoalDefinition {
            kind,
            gate,
            state,
            description: None,
        });
        self
    }

    pub fn gate(mut self, name: impl Into<GateName>, rule: RuleDefinition) -> Self {
        self.gates.insert(name.into(), rule);
        self
    }

    /// Map a raw fact to a canonical one. Remapping an alias keeps the later
    /// target and records an [`CompileWarning::AliasCollision`].
    pub fn alias(mut self, raw: impl Into<FactName>, canonical: impl Into<FactName>) -> Self {
        let raw = raw.into();
        let canonical = canonical.into();
        if let Some(previous) = self.aliases.insert(raw.clone(), canonical.clone())
            && previous != canonical
        {
            self.warnings.push(CompileWarning::AliasCollision {
                raw,
                previous,
                replacement: canonical,
            });
        }
        self
    }

    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn patch(mut self, node: impl Into<NodeId>, patch: NodePatch) -> Self {
        self.patches.push((node.into(), patch));
        self
    }

    /// Validate everything and produce the compiled model.
    pub fn build(self) -> Result<CompileReport, CompileErrors> {
        let mut errors = Vec::new();
        let mut warnings = self.warnings;

        for (raw, canonical) in &self.aliases {
            check_fact(raw, "factAliases key", &mut errors);
            check_fact(canonical, &format!("factAliases['{raw}']"), &mut errors);
        }

        let mut gate_definitions = BTreeMap::new();
        for (name, rule) in &self.gates {
            let rule = compile_rule(name, rule, &mut errors);
            if rule.is_empty() {
                warnings.push(CompileWarning::EmptyGateRule { gate: name.clone() });
            }
            gate_definitions.insert(name.clone(), rule);
        }

        let nodes = apply_patches(self.nodes, self.patches, &mut errors);

        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(nodes.len());
        for (order, node) in nodes.iter().enumerate() {
            if !seen.insert(node.id.as_str()) {
                errors.push(CompileError::DuplicateNode {
                    node: node.id.clone(),
                });
                continue;
            }
            compiled.push(compile_node(
                order,
                node,
                &gate_definitions,
                &self.aliases,
                &mut errors,
            ));
        }

        if self.entry_node_ids.is_empty() {
            errors.push(CompileError::NoEntryNodes);
        }
        for entry in &self.entry_node_ids {
            if !seen.contains(entry.as_str()) {
                errors.push(CompileError::UnknownEntryNode {
                    node: entry.clone(),
                });
            }
        }

        let primary_goal = match &self.goal {
            Some(goal) => compile_goal(goal, &gate_definitions, &mut errors),
            None => {
                errors.push(CompileError::MissingGoalTarget {
                    kind: "GATE".to_string(),
                    field: "gate".to_string(),
                });
                None
            }
        };

        let primary_goal = match primary_goal {
            Some(goal) if errors.is_empty() => goal,
            _ => return Err(CompileErrors(errors)),
        };

        warnings.extend(unreachable_gates(&gate_definitions, &compiled, &primary_goal));
        for warning in &warnings {
            warn!(%warning, "flow compile warning");
        }

        let model = FlowModel::new(
            self.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            self.entry_node_ids,
            primary_goal,
            gate_definitions,
            self.aliases,
            compiled,
        );
        Ok(CompileReport { model, warnings })
    }
}

/// Compile a parsed definition with the given version string.
pub fn compile(
    definition: FlowDefinition,
    version: impl Into<String>,
) -> Result<CompileReport, CompileErrors> {
    FlowBuilder::from_definition(definition)
        .version(version)
        .build()
}

fn check_fact(fact: &str, context: &str, errors: &mut Vec<CompileError>) {
    if !is_valid_fact_name(fact) {
        errors.push(CompileError::MalformedFactName {
            fact: fact.to_string(),
            context: context.to_string(),
        });
    }
}

/// Empty groups are treated as absent so `{ metricsAny: [] }` cannot
/// silently block a gate forever.
fn compile_rule(
    gate: &str,
    rule: &RuleDefinition,
    errors: &mut Vec<CompileError>,
) -> SatisfactionRule {
    let mut facts = |group: &Option<Vec<String>>, field: &str| -> Option<BTreeSet<FactName>> {
        let list = group.as_ref().filter(|list| !list.is_empty())?;
        for fact in list {
            check_fact(fact, &format!("gate '{gate}' {field}"), errors);
        }
        Some(list.iter().cloned().collect())
    };
    let metrics_all = facts(&rule.metrics_all, "metricsAll");
    let metrics_any = facts(&rule.metrics_any, "metricsAny");
    let states_all = rule
        .states_all
        .as_ref()
        .filter(|list| !list.is_empty())
        .map(|list| list.iter().cloned().collect());
    SatisfactionRule {
        metrics_all,
        metrics_any,
        states_all,
    }
}

fn apply_patches(
    nodes: Vec<NodeDefinition>,
    patches: Vec<(NodeId, NodePatch)>,
    errors: &mut Vec<CompileError>,
) -> Vec<NodeDefinition> {
    let mut nodes = nodes;
    for (target, patch) in patches {
        match nodes.iter().position(|node| node.id == target) {
            Some(idx) => nodes[idx] = nodes[idx].patched(&patch),
            None => errors.push(CompileError::UnknownPatchTarget { node: target }),
        }
    }
    nodes
}

fn compile_node(
    order: usize,
    node: &NodeDefinition,
    gates: &BTreeMap<GateName, SatisfactionRule>,
    aliases: &BTreeMap<FactName, FactName>,
    errors: &mut Vec<CompileError>,
) -> NodeDef {
    let config = &node.config;
    let requires = node.requires.clone().unwrap_or_default();
    let satisfies = config.satisfies.clone().unwrap_or_default();

    for gate in requires.gates.iter().chain(&satisfies.gates) {
        if !gates.contains_key(gate) {
            errors.push(CompileError::UndefinedGate {
                node: node.id.clone(),
                gate: gate.clone(),
            });
        }
    }

    let produces_facts: BTreeSet<FactName> = node
        .produces
        .as_ref()
        .map(|produces| produces.facts.iter().cloned().collect())
        .unwrap_or_default();
    for fact in &produces_facts {
        check_fact(fact, &format!("node '{}' produces", node.id), errors);
    }
    let mut requires_facts = BTreeSet::new();
    for fact in &requires.facts {
        check_fact(fact, &format!("node '{}' requires", node.id), errors);
        requires_facts.insert(aliases.get(fact).unwrap_or(fact).clone());
    }

    let run_policy = RunPolicy {
        max_executions: config.run_policy.and_then(|policy| policy.max_executions),
    };
    if run_policy.max_executions == Some(0) {
        errors.push(CompileError::InvalidRunPolicy {
            node: node.id.clone(),
        });
    }

    let defaults = RetryPolicy::default();
    let retry_policy = match config.retry_policy {
        Some(retry) => RetryPolicy {
            max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
            on_exhaust: retry.on_exhaust.unwrap_or(defaults.on_exhaust),
            cooldown_turns: retry.cooldown_turns.unwrap_or(defaults.cooldown_turns),
            prompt_variant_strategy: retry
                .prompt_variant_strategy
                .unwrap_or(defaults.prompt_variant_strategy),
        },
        None => defaults,
    };
    if retry_policy.max_attempts == 0 {
        errors.push(CompileError::InvalidRetryPolicy {
            node: node.id.clone(),
        });
    }

    NodeDef {
        id: node.id.clone(),
        kind: node.kind.clone(),
        title: node.title.clone(),
        order,
        requires_gates: requires.gates.into_iter().collect(),
        requires_states: config
            .requires_states
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        requires_facts,
        produces_facts,
        satisfies_gates: satisfies.gates.into_iter().collect(),
        satisfies_states: satisfies.states.into_iter().collect(),
        run_policy,
        retry_policy,
        importance: config.importance.unwrap_or_default(),
    }
}

fn compile_goal(
    goal: &GoalDefinition,
    gates: &BTreeMap<GateName, SatisfactionRule>,
    errors: &mut Vec<CompileError>,
) -> Option<PrimaryGoal> {
    let (target, field, kind) = match goal.kind {
        GoalKind::Gate => (goal.gate.as_ref(), "gate", "GATE"),
        GoalKind::State => (goal.state.as_ref(), "state", "STATE"),
    };
    let Some(target) = target.filter(|name| !name.trim().is_empty()) else {
        errors.push(CompileError::MissingGoalTarget {
            kind: kind.to_string(),
            field: field.to_string(),
        });
        return None;
    };
    if goal.kind == GoalKind::Gate && !gates.contains_key(target) {
        errors.push(CompileError::UndefinedGoalGate {
            gate: target.clone(),
        });
    }
    Some(PrimaryGoal {
        kind: goal.kind,
        target: target.clone(),
        description: goal.description.clone(),
    })
}

fn unreachable_gates(
    gates: &BTreeMap<GateName, SatisfactionRule>,
    nodes: &[NodeDef],
    goal: &PrimaryGoal,
) -> Vec<CompileWarning> {
    let mut referenced: HashSet<&str> = nodes
        .iter()
        .flat_map(|node| node.requires_gates.iter().chain(&node.satisfies_gates))
        .map(String::as_str)
        .collect();
    if goal.kind == GoalKind::Gate {
        referenced.insert(goal.target.as_str());
    }
    gates
        .keys()
        .filter(|gate| !referenced.contains(gate.as_str()))
        .map(|gate| CompileWarning::UnreachableGate { gate: gate.clone() })
        .collect()
}
