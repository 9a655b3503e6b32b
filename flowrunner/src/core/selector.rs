//! Deterministic selection and mode resolution among eligible nodes.

use std::cmp::Reverse;

use crate::core::model::NodeDef;
use crate::core::state::RuntimeState;
use crate::core::types::{Mode, NodeId, OnExhaust};

/// Node chosen for a turn, with its resolved mode.
///
/// `mode` is never `Mode::Skip`: skipped nodes are listed in `skipped` and the
/// next candidate is tried instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<'a> {
    pub node: &'a NodeDef,
    pub mode: Mode,
    pub skipped: Vec<NodeId>,
}

/// Sort candidates by importance (high first), then fewest attempts, then
/// declaration order.
pub fn rank(candidates: &mut [&NodeDef], state: &RuntimeState) {
    candidates.sort_by_key(|node| (Reverse(node.importance), state.attempts(&node.id), node.order));
}

/// True when the node declares an objective and all of it already holds.
pub fn objective_satisfied(node: &NodeDef, state: &RuntimeState) -> bool {
    node.has_objective()
        && node
            .satisfies_gates
            .iter()
            .all(|gate| state.gate_satisfied(gate))
        && node
            .satisfies_states
            .iter()
            .all(|name| state.has_state(name))
}

/// Resolve the execution mode for a selected node from its attempt count.
pub fn resolve_mode(node: &NodeDef, state: &RuntimeState) -> Mode {
    let attempts = state.attempts(&node.id);
    if attempts == 0 {
        return Mode::Execute;
    }
    if objective_satisfied(node, state) {
        return Mode::Execute;
    }
    let max_attempts = node.retry_policy.max_attempts;
    if attempts < max_attempts {
        return Mode::Retry;
    }
    match node.retry_policy.on_exhaust {
        // One clarifying attempt past the budget; the rule does not re-loop.
        OnExhaust::Clarify if attempts == max_attempts => Mode::Retry,
        OnExhaust::Clarify => Mode::Skip,
        OnExhaust::Broaden => Mode::Broaden,
        OnExhaust::Handoff => Mode::Handoff,
        OnExhaust::Skip => Mode::Skip,
    }
}

/// Rank candidates and return the first whose mode is not `SKIP`.
///
/// Returns `None` when there are no candidates or every candidate skips.
pub fn select<'a>(mut candidates: Vec<&'a NodeDef>, state: &RuntimeState) -> Option<Selection<'a>> {
    rank(&mut candidates, state);
    let mut skipped = Vec::new();
    for node in candidates {
        match resolve_mode(node, state) {
            Mode::Skip => skipped.push(node.id.clone()),
            mode => {
                return Some(Selection {
                    node,
                    mode,
                    skipped,
                });
            }
        }
    }
    None
}

/// Human-readable justification recorded on the execution node.
pub fn explain(selection: &Selection<'_>, state: &RuntimeState) -> String {
    let node = selection.node;
    let attempts = state.attempts(&node.id);
    let why = match selection.mode {
        Mode::Execute if attempts == 0 => "first attempt".to_string(),
        Mode::Execute => "objective already satisfied, moving on".to_string(),
        Mode::Retry if attempts >= node.retry_policy.max_attempts => {
            "retry budget spent, one clarifying attempt".to_string()
        }
        Mode::Retry => format!(
            "attempt {} of {}",
            attempts + 1,
            node.retry_policy.max_attempts
        ),
        Mode::Broaden => "retry budget spent, broadening".to_string(),
        Mode::Handoff => "retry budget spent, escalating to a human".to_string(),
        Mode::Skip => "skipped".to_string(),
    };
    let mut text = format!(
        "selected {} (importance={:?}, attempts={}): {}",
        node.id, node.importance, attempts, why
    );
    if !selection.skipped.is_empty() {
        text.push_str(&format!("; skipped {}", selection.skipped.join(", ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Importance;
    use crate::test_support::{compiled_node, past_first_turn};

    #[test]
    fn rank_prefers_importance_then_fewest_attempts() {
        let low = compiled_node("low", 0, Importance::Low);
        let tried = compiled_node("tried", 1, Importance::High);
        let fresh = compiled_node("fresh", 2, Importance::High);
        let mut state = RuntimeState::new();
        state.record_attempt("tried");

        let mut candidates = vec![&low, &tried, &fresh];
        rank(&mut candidates, &state);
        let ids: Vec<&str> = candidates.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "tried", "low"]);
    }

    #[test]
    fn rank_falls_back_to_declaration_order() {
        let second = compiled_node("b", 1, Importance::Normal);
        let first = compiled_node("a", 0, Importance::Normal);
        let mut candidates = vec![&second, &first];
        rank(&mut candidates, &RuntimeState::new());
        assert_eq!(candidates[0].id, "a");
    }

    #[test]
    fn mode_progresses_execute_retry_then_on_exhaust() {
        let mut node = compiled_node("n", 0, Importance::Normal);
        node.retry_policy.max_attempts = 2;
        node.retry_policy.on_exhaust = OnExhaust::Broaden;
        node.satisfies_gates.insert("G".to_string());
        let mut state = past_first_turn();

        assert_eq!(resolve_mode(&node, &state), Mode::Execute);
        state.record_attempt("n");
        assert_eq!(resolve_mode(&node, &state), Mode::Retry);
        state.record_attempt("n");
        assert_eq!(resolve_mode(&node, &state), Mode::Broaden);
    }

    #[test]
    fn satisfied_objective_moves_on_with_execute() {
        let mut node = compiled_node("n", 0, Importance::Normal);
        node.satisfies_states.insert("greeted".to_string());
        let mut state = RuntimeState::new();
        state.record_attempt("n");
        state.insert_state("greeted");
        assert_eq!(resolve_mode(&node, &state), Mode::Execute);
    }

    #[test]
    fn node_without_objective_is_not_auto_passed() {
        let node = compiled_node("n", 0, Importance::Normal);
        let mut state = RuntimeState::new();
        state.record_attempt("n");
        assert_eq!(resolve_mode(&node, &state), Mode::Retry);
    }

    /// CLARIFY grants exactly one extra retry, then the node is skipped.
    #[test]
    fn clarify_grants_one_extra_retry() {
        let mut node = compiled_node("n", 0, Importance::Normal);
        node.retry_policy.max_attempts = 1;
        node.retry_policy.on_exhaust = OnExhaust::Clarify;
        let mut state = RuntimeState::new();
        state.record_attempt("n");
        assert_eq!(resolve_mode(&node, &state), Mode::Retry);
        state.record_attempt("n");
        assert_eq!(resolve_mode(&node, &state), Mode::Skip);
    }

    #[test]
    fn select_passes_over_skipped_nodes() {
        let mut exhausted = compiled_node("exhausted", 0, Importance::High);
        exhausted.retry_policy.max_attempts = 1;
        exhausted.retry_policy.on_exhaust = OnExhaust::Skip;
        let next = compiled_node("next", 1, Importance::Low);
        let mut state = RuntimeState::new();
        state.record_attempt("exhausted");

        let selection = select(vec![&exhausted, &next], &state).expect("selection");
        assert_eq!(selection.node.id, "next");
        assert_eq!(selection.mode, Mode::Execute);
        assert_eq!(selection.skipped, vec!["exhausted".to_string()]);
        assert!(explain(&selection, &state).contains("skipped exhausted"));
    }

    #[test]
    fn select_returns_none_when_all_skip() {
        let mut only = compiled_node("only", 0, Importance::Normal);
        only.retry_policy.max_attempts = 1;
        only.retry_policy.on_exhaust = OnExhaust::Skip;
        let mut state = RuntimeState::new();
        state.record_attempt("only");
        assert!(select(vec![&only], &state).is_none());
        assert!(select(Vec::new(), &state).is_none());
    }
}
