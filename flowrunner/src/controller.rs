//! One-turn orchestration: gates, goal, eligibility, selection, effects.
//!
//! [`Controller::turn`] never mutates its input. It works on a clone and
//! hands back the next state only when the turn commits, so a failing
//! extractor or a terminal result leaves the caller's state untouched.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::eligibility::eligible_nodes;
use crate::core::facts::merge_facts;
use crate::core::gates::{goal_satisfied, refresh};
use crate::core::model::FlowModel;
use crate::core::selector::{explain, select};
use crate::core::state::{RuntimeState, TurnRecord};
use crate::core::types::{
    FactName, Importance, Mode, NodeId, ReadinessDelta, StateName, TurnStatus,
};
use crate::io::config::{ControllerConfig, PostGoalPolicy};
use crate::io::extractor::{ExtractionRequest, Extractor};

/// What the controller decided for a committed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub flow_node: NodeId,
    pub mode: Mode,
    pub reasoning: String,
    pub skipped: Vec<NodeId>,
    pub forced_by_stagnation: bool,
    pub prompt_variant: u32,
}

/// Result of one controller call.
#[derive(Debug, Clone)]
pub struct Turn {
    pub status: TurnStatus,
    /// `None` for terminal results that commit nothing.
    pub decision: Option<Decision>,
    pub delta: ReadinessDelta,
    pub agent_message: Option<String>,
    /// State after the turn; equal to the input when nothing committed.
    pub state: RuntimeState,
}

impl Turn {
    fn terminal(status: TurnStatus, state: &RuntimeState) -> Self {
        Self {
            status,
            decision: None,
            delta: ReadinessDelta::default(),
            agent_message: None,
            state: state.clone(),
        }
    }

    pub fn committed(&self) -> bool {
        self.decision.is_some()
    }
}

pub struct Controller<'a> {
    flow: &'a FlowModel,
    config: &'a ControllerConfig,
}

impl<'a> Controller<'a> {
    pub fn new(flow: &'a FlowModel, config: &'a ControllerConfig) -> Self {
        Self { flow, config }
    }

    /// Run one turn against `state`.
    pub fn turn(
        &self,
        state: &RuntimeState,
        user_message: Option<&str>,
        extractor: &dyn Extractor,
    ) -> Result<Turn> {
        let flow = self.flow;
        if state.is_handed_off() {
            debug!("path already handed off");
            return Ok(Turn::terminal(TurnStatus::Handoff, state));
        }

        let mut next = state.clone();
        let mut unlocked = refresh(flow, &mut next);

        let goal_met = goal_satisfied(flow, &next);
        if goal_met && self.config.post_goal_policy == PostGoalPolicy::Stop {
            debug!("primary goal satisfied");
            return Ok(Turn::terminal(TurnStatus::Complete, state));
        }

        let mut candidates = eligible_nodes(flow, &next);
        if goal_met {
            candidates.retain(|node| node.importance == Importance::High);
        }
        let idle = if goal_met {
            TurnStatus::Complete
        } else {
            TurnStatus::Deadlock
        };
        let Some(mut selection) = select(candidates, &next) else {
            if idle == TurnStatus::Deadlock {
                warn!(turn = next.next_turn(), "no eligible node while goal is unmet");
            }
            return Ok(Turn::terminal(idle, state));
        };

        let node = selection.node;
        let mut reasoning = explain(&selection, &next);
        let forced_by_stagnation = match next.stagnation() {
            Some(tracker)
                if tracker.node == node.id && tracker.streak >= self.config.stagnation_threshold =>
            {
                let forced = if matches!(selection.mode, Mode::Broaden | Mode::Handoff)
                    || tracker.escalated
                {
                    Mode::Handoff
                } else {
                    Mode::Broaden
                };
                warn!(
                    node = %node.id,
                    streak = tracker.streak,
                    from = %selection.mode,
                    to = %forced,
                    "stagnation detected; escalating"
                );
                reasoning.push_str(&format!(
                    "; stagnated for {} turns, forced {}",
                    tracker.streak, forced
                ));
                selection.mode = forced;
                true
            }
            _ => false,
        };
        let mode = selection.mode;
        let turn_number = next.next_turn();
        let prompt_variant = node
            .retry_policy
            .prompt_variant_strategy
            .variant_index(next.attempts(&node.id));
        debug!(turn = turn_number, node = %node.id, %mode, "node selected");

        let extraction = match mode {
            Mode::Execute | Mode::Retry | Mode::Broaden => {
                let request = ExtractionRequest {
                    node,
                    mode,
                    user_message,
                    known_facts: next.facts(),
                    prompt_variant,
                };
                Some(
                    extractor
                        .extract(&request)
                        .with_context(|| format!("extract facts for node {}", node.id))?,
                )
            }
            Mode::Handoff | Mode::Skip => None,
        };

        let mut facts_added: Vec<FactName> = Vec::new();
        let mut states_added: Vec<StateName> = Vec::new();
        let mut cooldown_until = None;
        match mode {
            Mode::Execute => {
                next.record_attempt(&node.id);
                next.record_execution(&node.id);
                for name in &node.satisfies_states {
                    if next.insert_state(name.clone()) {
                        states_added.push(name.clone());
                    }
                }
            }
            Mode::Retry => {
                next.record_attempt(&node.id);
                let cooldown = node.retry_policy.cooldown_turns;
                if cooldown > 0 {
                    let eligible_at = turn_number + cooldown + 1;
                    next.set_cooldown(&node.id, eligible_at);
                    cooldown_until = Some(eligible_at);
                }
            }
            Mode::Broaden => next.record_attempt(&node.id),
            Mode::Handoff => next.mark_handed_off(),
            Mode::Skip => {}
        }
        let agent_message = extraction.as_ref().and_then(|e| e.agent_message.clone());
        if let Some(extraction) = extraction {
            facts_added = merge_facts(flow, &mut next, extraction.facts);
        }
        unlocked.extend(refresh(flow, &mut next));
        unlocked.sort();
        unlocked.dedup();

        let progressed = !facts_added.is_empty() || !states_added.is_empty();
        next.commit_turn(
            TurnRecord {
                turn: turn_number,
                flow_node: node.id.clone(),
                mode,
                skipped: selection.skipped.clone(),
                facts_added: facts_added.clone(),
                states_added,
                gates_unlocked: unlocked.clone(),
                forced_by_stagnation,
                cooldown_until,
            },
            progressed,
        );
        info!(
            turn = turn_number,
            node = %node.id,
            %mode,
            facts_added = facts_added.len(),
            gates_unlocked = unlocked.len(),
            "turn committed"
        );

        let status = if mode == Mode::Handoff {
            TurnStatus::Handoff
        } else {
            TurnStatus::Advancing
        };
        Ok(Turn {
            status,
            decision: Some(Decision {
                flow_node: node.id.clone(),
                mode,
                reasoning,
                skipped: selection.skipped,
                forced_by_stagnation,
                prompt_variant,
            }),
            delta: ReadinessDelta {
                added: facts_added,
                unlocked,
            },
            agent_message,
            state: next,
        })
    }
}
