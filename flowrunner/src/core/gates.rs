//! Gate evaluation.
//!
//! Gates are re-evaluated from scratch every turn. Evaluation is pure and
//! order-independent; only [`refresh`] writes, and it only ever adds gates.

use std::collections::BTreeSet;

use crate::core::model::{FlowModel, SatisfactionRule};
use crate::core::state::RuntimeState;
use crate::core::types::{GateName, GoalKind};

/// Evaluate a satisfaction rule against the state.
///
/// All present groups must pass. A rule with no groups is vacuously satisfied.
pub fn satisfied(rule: &SatisfactionRule, state: &RuntimeState) -> bool {
    if let Some(all) = &rule.metrics_all
        && !all.iter().all(|fact| state.has_fact(fact))
    {
        return false;
    }
    if let Some(any) = &rule.metrics_any
        && !any.iter().any(|fact| state.has_fact(fact))
    {
        return false;
    }
    if let Some(states) = &rule.states_all
        && !states.iter().all(|name| state.has_state(name))
    {
        return false;
    }
    true
}

/// Evaluate a named gate. Unknown gates are never satisfied.
pub fn gate_satisfied(flow: &FlowModel, gate: &str, state: &RuntimeState) -> bool {
    flow.gate(gate).is_some_and(|rule| satisfied(rule, state))
}

/// Every gate whose rule currently holds.
pub fn evaluate_all(flow: &FlowModel, state: &RuntimeState) -> BTreeSet<GateName> {
    flow.gates()
        .filter(|(_, rule)| satisfied(rule, state))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Recompute gates and union them into `gates_satisfied`.
///
/// Returns gates that became satisfied by this call, sorted.
pub fn refresh(flow: &FlowModel, state: &mut RuntimeState) -> Vec<GateName> {
    let mut unlocked = Vec::new();
    for gate in evaluate_all(flow, state) {
        if state.insert_gate(gate.clone()) {
            unlocked.push(gate);
        }
    }
    unlocked
}

/// True when the flow's primary goal holds.
pub fn goal_satisfied(flow: &FlowModel, state: &RuntimeState) -> bool {
    let goal = flow.primary_goal();
    match goal.kind {
        GoalKind::Gate => state.gate_satisfied(&goal.target),
        GoalKind::State => state.has_state(&goal.target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{any_of, contact_flow, rule};

    fn state_with(facts: &[&str], states: &[&str]) -> RuntimeState {
        let mut state = RuntimeState::new();
        for fact in facts {
            state.insert_fact(*fact);
        }
        for name in states {
            state.insert_state(*name);
        }
        state
    }

    #[test]
    fn metrics_all_requires_every_fact() {
        let rule = rule(&["a", "b"], &[], &[]);
        assert!(!satisfied(&rule, &state_with(&["a"], &[])));
        assert!(satisfied(&rule, &state_with(&["a", "b"], &[])));
    }

    #[test]
    fn metrics_any_requires_one_fact() {
        let rule = any_of(&["contact_email", "contact_phone"]);
        assert!(!satisfied(&rule, &state_with(&[], &[])));
        assert!(satisfied(&rule, &state_with(&["contact_phone"], &[])));
    }

    #[test]
    fn groups_are_combined_with_and() {
        let rule = rule(&["a"], &["b", "c"], &["greeted"]);
        assert!(!satisfied(&rule, &state_with(&["a", "b"], &[])));
        assert!(satisfied(&rule, &state_with(&["a", "c"], &["greeted"])));
    }

    #[test]
    fn empty_rule_is_vacuously_satisfied() {
        assert!(satisfied(&SatisfactionRule::default(), &RuntimeState::new()));
    }

    #[test]
    fn unknown_gate_is_never_satisfied() {
        let flow = contact_flow();
        assert!(!gate_satisfied(&flow, "NOPE", &RuntimeState::new()));
    }

    /// Refresh reports only newly unlocked gates and never drops satisfied ones.
    #[test]
    fn refresh_unions_and_reports_new_gates() {
        let flow = contact_flow();
        let mut state = RuntimeState::new();
        assert!(refresh(&flow, &mut state).is_empty());

        state.insert_fact("contact_email");
        assert_eq!(refresh(&flow, &mut state), vec!["CONTACT".to_string()]);
        assert!(refresh(&flow, &mut state).is_empty());
        assert!(state.gate_satisfied("CONTACT"));
    }

    #[test]
    fn goal_follows_gate() {
        let flow = contact_flow();
        let mut state = state_with(&["contact_email"], &[]);
        assert!(!goal_satisfied(&flow, &state));
        state.insert_state("booked");
        refresh(&flow, &mut state);
        assert!(goal_satisfied(&flow, &state));
    }
}
