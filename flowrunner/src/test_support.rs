//! Test-only fixtures: flows, nodes, history drafts, scripted seams.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::core::history::{ExecutionNode, NodeDraft};
use crate::core::model::{FlowModel, NodeDef, RetryPolicy, RunPolicy, SatisfactionRule};
use crate::core::state::{RuntimeState, TurnRecord};
use crate::core::types::{GoalKind, Importance, Mode, NodeId, OnExhaust};
use crate::flow::{FlowBuilder, NodeDefinition, RuleDefinition};
use crate::io::extractor::{Extraction, ExtractionRequest, Extractor};
use crate::run::Clock;

fn set(items: &[&str]) -> Option<BTreeSet<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items.iter().map(ToString::to_string).collect())
    }
}

/// Satisfaction rule from slices; empty slices leave the group absent.
pub fn rule(metrics_all: &[&str], metrics_any: &[&str], states_all: &[&str]) -> SatisfactionRule {
    SatisfactionRule {
        metrics_all: set(metrics_all),
        metrics_any: set(metrics_any),
        states_all: set(states_all),
    }
}

pub fn any_of(facts: &[&str]) -> SatisfactionRule {
    rule(&[], facts, &[])
}

pub fn any_rule(facts: &[&str]) -> RuleDefinition {
    RuleDefinition {
        metrics_any: Some(facts.iter().map(ToString::to_string).collect()),
        ..RuleDefinition::default()
    }
}

pub fn states_rule(states: &[&str]) -> RuleDefinition {
    RuleDefinition {
        states_all: Some(states.iter().map(ToString::to_string).collect()),
        ..RuleDefinition::default()
    }
}

/// Builder for the contact-then-book flow used across tests.
///
/// - `CONTACT = metricsAny[contact_email, contact_phone]`
/// - `BOOKED = statesAll[booked]` (primary goal)
/// - `contact-1` (entry): produces `email`/`phone`, retry `{2, BROADEN}`
/// - `book-1`: requires `CONTACT`, runs at most once, sets `booked`
pub fn contact_flow_builder() -> FlowBuilder {
    FlowBuilder::new()
        .version("contact-v1")
        .entry("contact-1")
        .goal(GoalKind::Gate, "BOOKED")
        .gate("CONTACT", any_rule(&["contact_email", "contact_phone"]))
        .gate("BOOKED", states_rule(&["booked"]))
        .alias("email", "contact_email")
        .alias("phone", "contact_phone")
        .node(
            NodeDefinition::new("contact-1")
                .produces(["email", "phone"])
                .satisfies_gates(["CONTACT"])
                .retry(2, OnExhaust::Broaden),
        )
        .node(
            NodeDefinition::new("book-1")
                .requires_gates(["CONTACT"])
                .satisfies_states(["booked"])
                .satisfies_gates(["BOOKED"])
                .max_executions(1),
        )
}

pub fn contact_flow() -> FlowModel {
    contact_flow_builder().build().expect("contact flow compiles").model
}

/// State with one committed turn, so the entry-only first-turn rule is off.
pub fn past_first_turn() -> RuntimeState {
    let mut state = RuntimeState::new();
    state.commit_turn(
        TurnRecord {
            turn: 1,
            flow_node: "warmup".to_string(),
            mode: Mode::Execute,
            skipped: Vec::new(),
            facts_added: Vec::new(),
            states_added: Vec::new(),
            gates_unlocked: Vec::new(),
            forced_by_stagnation: false,
            cooldown_until: None,
        },
        true,
    );
    state
}

/// Compiled node with default policies and no requirements.
pub fn compiled_node(id: &str, order: usize, importance: Importance) -> NodeDef {
    NodeDef {
        id: id.to_string(),
        kind: "step".to_string(),
        title: id.to_string(),
        order,
        requires_gates: BTreeSet::new(),
        requires_states: BTreeSet::new(),
        requires_facts: BTreeSet::new(),
        produces_facts: BTreeSet::new(),
        satisfies_gates: BTreeSet::new(),
        satisfies_states: BTreeSet::new(),
        run_policy: RunPolicy::default(),
        retry_policy: RetryPolicy::default(),
        importance,
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn draft(parent: Option<&str>, branch: &str, turn: u32, user: Option<&str>) -> NodeDraft {
    NodeDraft {
        parent_id: parent.map(ToString::to_string),
        branch_id: branch.to_string(),
        turn_number: turn,
        user_message: user.map(ToString::to_string),
        agent_message: None,
        flow_node_id: "node".to_string(),
        known_facts_before: BTreeSet::new(),
        known_facts_after: BTreeSet::new(),
        decision: Mode::Execute,
        reasoning: String::new(),
        timestamp: at(i64::from(turn)),
    }
}

pub fn exec_node(
    id: &str,
    parent: Option<&str>,
    branch: &str,
    turn: u32,
    user: Option<&str>,
    ts_secs: i64,
) -> ExecutionNode {
    let draft = draft(parent, branch, turn, user);
    ExecutionNode {
        id: id.to_string(),
        parent_id: draft.parent_id,
        branch_id: draft.branch_id,
        turn_number: draft.turn_number,
        user_message: draft.user_message,
        agent_message: draft.agent_message,
        flow_node_id: draft.flow_node_id,
        known_facts_before: draft.known_facts_before,
        known_facts_after: draft.known_facts_after,
        decision: draft.decision,
        reasoning: draft.reasoning,
        timestamp: at(ts_secs),
    }
}

/// Extractor that replays queued extractions and records who asked.
///
/// Once the queue is empty every call extracts nothing.
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    queue: RefCell<VecDeque<Extraction>>,
    calls: RefCell<Vec<(NodeId, Mode)>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one extraction yielding `facts`.
    pub fn then(self, facts: &[&str]) -> Self {
        self.queue.borrow_mut().push_back(Extraction {
            facts: facts.iter().map(ToString::to_string).collect(),
            agent_message: None,
        });
        self
    }

    pub fn calls(&self) -> Vec<(NodeId, Mode)> {
        self.calls.borrow().clone()
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<Extraction> {
        self.calls
            .borrow_mut()
            .push((request.node.id.clone(), request.mode));
        Ok(self.queue.borrow_mut().pop_front().unwrap_or_default())
    }
}

/// Extractor that always fails, for atomicity tests.
pub struct FailingExtractor;

impl Extractor for FailingExtractor {
    fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<Extraction> {
        Err(anyhow::anyhow!("extraction backend unavailable"))
    }
}

/// Clock that ticks one second per reading.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: Cell<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.ticks.get() + 1;
        self.ticks.set(tick);
        at(tick)
    }
}
