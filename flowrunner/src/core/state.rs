//! Per-path runtime accumulator.
//!
//! One `RuntimeState` exists for every conversation path: a path's state is
//! the fold of its turn records from the root, so branches never share
//! counters. `facts`, `states`, and `gates_satisfied` only grow. The mutators
//! below are the only way to change them and none of them removes an entry.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{FactName, GateName, Mode, NodeId, StateName};

/// Consecutive no-progress selections of the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagnationTracker {
    pub node: NodeId,
    /// Previous consecutive turns that selected `node` without changing facts or states.
    pub streak: u32,
    /// The previous turn was already force-escalated.
    pub escalated: bool,
}

/// Immutable audit entry for one committed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub flow_node: NodeId,
    pub mode: Mode,
    /// Nodes passed over this turn because their retry policy resolved to `SKIP`.
    pub skipped: Vec<NodeId>,
    pub facts_added: Vec<FactName>,
    pub states_added: Vec<StateName>,
    pub gates_unlocked: Vec<GateName>,
    pub forced_by_stagnation: bool,
    /// Cooldown a `RETRY` placed on `flow_node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<u32>,
}

impl TurnRecord {
    /// Facts or states changed this turn.
    pub fn progressed(&self) -> bool {
        !self.facts_added.is_empty() || !self.states_added.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    facts: BTreeSet<FactName>,
    states: BTreeSet<StateName>,
    gates_satisfied: BTreeSet<GateName>,
    attempts_by_node: BTreeMap<NodeId, u32>,
    executions_by_node: BTreeMap<NodeId, u32>,
    /// Node is eligible again once the upcoming turn number reaches this value.
    cooldown_until: BTreeMap<NodeId, u32>,
    turns_committed: u32,
    stagnation: Option<StagnationTracker>,
    handed_off: bool,
    turn_log: Vec<TurnRecord>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self) -> &BTreeSet<FactName> {
        &self.facts
    }

    pub fn has_fact(&self, fact: &str) -> bool {
        self.facts.contains(fact)
    }

    pub fn states(&self) -> &BTreeSet<StateName> {
        &self.states
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    pub fn gates_satisfied(&self) -> &BTreeSet<GateName> {
        &self.gates_satisfied
    }

    pub fn gate_satisfied(&self, gate: &str) -> bool {
        self.gates_satisfied.contains(gate)
    }

    pub fn attempts(&self, node: &str) -> u32 {
        self.attempts_by_node.get(node).copied().unwrap_or(0)
    }

    pub fn executions(&self, node: &str) -> u32 {
        self.executions_by_node.get(node).copied().unwrap_or(0)
    }

    pub fn attempts_by_node(&self) -> &BTreeMap<NodeId, u32> {
        &self.attempts_by_node
    }

    pub fn executions_by_node(&self) -> &BTreeMap<NodeId, u32> {
        &self.executions_by_node
    }

    pub fn cooldown_until(&self, node: &str) -> Option<u32> {
        self.cooldown_until.get(node).copied()
    }

    pub fn turns_committed(&self) -> u32 {
        self.turns_committed
    }

    /// Turn number the next committed turn will receive (1-indexed).
    pub fn next_turn(&self) -> u32 {
        self.turns_committed + 1
    }

    pub fn stagnation(&self) -> Option<&StagnationTracker> {
        self.stagnation.as_ref()
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off
    }

    pub fn turn_log(&self) -> &[TurnRecord] {
        &self.turn_log
    }

    /// Insert a canonical fact. Returns true if it was new.
    pub fn insert_fact(&mut self, fact: impl Into<FactName>) -> bool {
        self.facts.insert(fact.into())
    }

    /// Insert a state. Returns true if it was new.
    pub fn insert_state(&mut self, state: impl Into<StateName>) -> bool {
        self.states.insert(state.into())
    }

    /// Mark a gate satisfied. Returns true if it was newly satisfied.
    pub fn insert_gate(&mut self, gate: impl Into<GateName>) -> bool {
        self.gates_satisfied.insert(gate.into())
    }

    pub fn record_attempt(&mut self, node: &str) {
        *self.attempts_by_node.entry(node.to_string()).or_insert(0) += 1;
    }

    pub fn record_execution(&mut self, node: &str) {
        *self.executions_by_node.entry(node.to_string()).or_insert(0) += 1;
    }

    pub fn set_cooldown(&mut self, node: &str, eligible_at_turn: u32) {
        self.cooldown_until
            .insert(node.to_string(), eligible_at_turn);
    }

    pub fn mark_handed_off(&mut self) {
        self.handed_off = true;
    }

    /// Append the turn record, advance the turn counter, and update the
    /// stagnation tracker. `progressed` is true when facts or states changed.
    pub fn commit_turn(&mut self, record: TurnRecord, progressed: bool) {
        let node = record.flow_node.clone();
        let escalated = record.forced_by_stagnation;
        self.stagnation = Some(match self.stagnation.take() {
            _ if progressed => StagnationTracker {
                node,
                streak: 0,
                escalated: false,
            },
            Some(prev) if prev.node == node => StagnationTracker {
                node,
                streak: prev.streak + 1,
                escalated,
            },
            _ => StagnationTracker {
                node,
                streak: 1,
                escalated,
            },
        });
        self.turns_committed = record.turn;
        self.turn_log.push(record);
    }

    /// Re-apply a committed turn's effects, as the controller applied them.
    pub fn apply_record(&mut self, record: TurnRecord) {
        let node = record.flow_node.clone();
        match record.mode {
            Mode::Execute => {
                self.record_attempt(&node);
                self.record_execution(&node);
            }
            Mode::Retry | Mode::Broaden => self.record_attempt(&node),
            Mode::Handoff => self.mark_handed_off(),
            Mode::Skip => {}
        }
        if let Some(eligible_at) = record.cooldown_until {
            self.set_cooldown(&node, eligible_at);
        }
        for fact in &record.facts_added {
            self.insert_fact(fact.clone());
        }
        for state in &record.states_added {
            self.insert_state(state.clone());
        }
        for gate in &record.gates_unlocked {
            self.insert_gate(gate.clone());
        }
        let progressed = record.progressed();
        self.commit_turn(record, progressed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(turn: u32, node: &str) -> TurnRecord {
        TurnRecord {
            turn,
            flow_node: node.to_string(),
            mode: Mode::Retry,
            skipped: Vec::new(),
            facts_added: Vec::new(),
            states_added: Vec::new(),
            gates_unlocked: Vec::new(),
            forced_by_stagnation: false,
            cooldown_until: None,
        }
    }

    #[test]
    fn counters_default_to_zero() {
        let state = RuntimeState::new();
        assert_eq!(state.attempts("a"), 0);
        assert_eq!(state.executions("a"), 0);
        assert_eq!(state.next_turn(), 1);
    }

    #[test]
    fn insert_reports_novelty() {
        let mut state = RuntimeState::new();
        assert!(state.insert_fact("contact_email"));
        assert!(!state.insert_fact("contact_email"));
        assert!(state.has_fact("contact_email"));
    }

    /// Stagnation streak grows only while the same node repeats without progress.
    #[test]
    fn commit_turn_tracks_stagnation_streak() {
        let mut state = RuntimeState::new();
        state.commit_turn(record(1, "a"), false);
        state.commit_turn(record(2, "a"), false);
        assert_eq!(state.stagnation().map(|s| s.streak), Some(2));

        state.commit_turn(record(3, "b"), false);
        assert_eq!(state.stagnation().map(|s| s.streak), Some(1));

        state.commit_turn(record(4, "b"), true);
        assert_eq!(state.stagnation().map(|s| s.streak), Some(0));
        assert_eq!(state.turns_committed(), 4);
        assert_eq!(state.turn_log().len(), 4);
    }

    #[test]
    fn apply_record_replays_effects() {
        let mut state = RuntimeState::new();
        state.apply_record(TurnRecord {
            mode: Mode::Execute,
            facts_added: vec!["contact_email".to_string()],
            states_added: vec!["booked".to_string()],
            gates_unlocked: vec!["CONTACT".to_string()],
            ..record(1, "a")
        });
        state.apply_record(TurnRecord {
            cooldown_until: Some(5),
            ..record(2, "b")
        });
        state.apply_record(TurnRecord {
            mode: Mode::Handoff,
            ..record(3, "b")
        });

        assert!(state.has_fact("contact_email"));
        assert!(state.has_state("booked"));
        assert!(state.gate_satisfied("CONTACT"));
        assert_eq!(state.attempts("a"), 1);
        assert_eq!(state.executions("a"), 1);
        assert_eq!(state.attempts("b"), 1);
        assert_eq!(state.cooldown_until("b"), Some(5));
        assert!(state.is_handed_off());
        assert_eq!(state.turns_committed(), 3);
        assert_eq!(state.stagnation().map(|s| s.streak), Some(2));
    }
}
