//! Node eligibility filter.

use serde::Serialize;

use crate::core::model::{FlowModel, NodeDef};
use crate::core::state::RuntimeState;
use crate::core::types::{FactName, GateName, StateName};

/// First reason a node cannot be selected this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Ineligible {
    /// Run policy cap reached.
    ExecutionLimit { executions: u32, max_executions: u32 },
    MissingGate { gate: GateName },
    MissingState { state: StateName },
    MissingFact { fact: FactName },
    /// Every gate the node satisfies holds and it already executed once.
    AlreadyAccomplished,
    /// A recent `RETRY` put the node on cooldown.
    CoolingDown { eligible_at_turn: u32 },
    /// First turn of a path only considers entry nodes.
    NotEntryNode,
}

/// Return why `node` is not eligible, or `None` if it is.
///
/// Checks run in a fixed order so the reported reason is deterministic.
pub fn ineligibility_reason(
    flow: &FlowModel,
    node: &NodeDef,
    state: &RuntimeState,
) -> Option<Ineligible> {
    let executions = state.executions(&node.id);
    if !node.run_policy.allows(executions) {
        return Some(Ineligible::ExecutionLimit {
            executions,
            max_executions: node.run_policy.max_executions.unwrap_or(u32::MAX),
        });
    }

    if let Some(gate) = node
        .requires_gates
        .iter()
        .find(|gate| !state.gate_satisfied(gate))
    {
        return Some(Ineligible::MissingGate { gate: gate.clone() });
    }

    if let Some(name) = node
        .requires_states
        .iter()
        .find(|name| !state.has_state(name))
    {
        return Some(Ineligible::MissingState {
            state: name.clone(),
        });
    }

    if let Some(fact) = node
        .requires_facts
        .iter()
        .find(|fact| !state.has_fact(fact))
    {
        return Some(Ineligible::MissingFact { fact: fact.clone() });
    }

    if !node.satisfies_gates.is_empty()
        && node
            .satisfies_gates
            .iter()
            .all(|gate| state.gate_satisfied(gate))
        && executions >= 1
    {
        return Some(Ineligible::AlreadyAccomplished);
    }

    if let Some(until) = state.cooldown_until(&node.id)
        && state.next_turn() < until
    {
        return Some(Ineligible::CoolingDown {
            eligible_at_turn: until,
        });
    }

    if state.turns_committed() == 0 && !flow.is_entry(&node.id) {
        return Some(Ineligible::NotEntryNode);
    }

    None
}

pub fn eligible(flow: &FlowModel, node: &NodeDef, state: &RuntimeState) -> bool {
    ineligibility_reason(flow, node, state).is_none()
}

/// Eligible nodes in declaration order.
pub fn eligible_nodes<'a>(flow: &'a FlowModel, state: &RuntimeState) -> Vec<&'a NodeDef> {
    flow.nodes()
        .iter()
        .filter(|node| eligible(flow, node, state))
        .collect()
}
