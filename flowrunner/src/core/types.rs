//! Shared deterministic types for controller core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.
//! Every string enum of the flow JSON is a closed enumeration here, so an
//! illegal value fails at parse time instead of surfacing mid-conversation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Flow node identifier (declared in the flow definition).
pub type NodeId = String;
/// Gate identifier.
pub type GateName = String;
/// Conversation state identifier.
pub type StateName = String;
/// Canonical (or raw, before aliasing) fact identifier.
pub type FactName = String;
/// Branch identifier within a run.
pub type BranchId = String;
/// Execution history node identifier (one per committed turn).
pub type ExecNodeId = String;

/// Execution mode resolved for the selected node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Execute,
    Retry,
    Broaden,
    Handoff,
    Skip,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Execute => "EXECUTE",
            Mode::Retry => "RETRY",
            Mode::Broaden => "BROADEN",
            Mode::Handoff => "HANDOFF",
            Mode::Skip => "SKIP",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation applied once a node's retry budget is spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnExhaust {
    /// One extra clarifying `RETRY`, then the node is skipped.
    #[default]
    Clarify,
    Broaden,
    Handoff,
    Skip,
}

/// Node priority. Ordered `Low < Normal < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

/// How the external phrasing step should vary prompts across attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptVariantStrategy {
    #[default]
    Fixed,
    Rotate,
    Escalate,
}

/// Number of distinct prompt variants the phrasing step is expected to offer.
const PROMPT_VARIANTS: u32 = 3;

impl PromptVariantStrategy {
    /// Variant index handed to the phrasing step for a node with `attempts` so far.
    pub fn variant_index(self, attempts: u32) -> u32 {
        match self {
            PromptVariantStrategy::Fixed => 0,
            PromptVariantStrategy::Rotate => attempts % PROMPT_VARIANTS,
            PromptVariantStrategy::Escalate => attempts.min(PROMPT_VARIANTS - 1),
        }
    }
}

/// What the primary goal is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalKind {
    Gate,
    State,
}

/// Terminal state of one controller turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    /// A node was selected and the turn committed.
    Advancing,
    /// No eligible node while the goal is unmet.
    Deadlock,
    /// Primary goal satisfied.
    Complete,
    /// The run escalated to a human.
    Handoff,
}

impl TurnStatus {
    pub fn outcome(self) -> OutcomeCode {
        match self {
            TurnStatus::Advancing => OutcomeCode::Ok,
            TurnStatus::Deadlock => OutcomeCode::Deadlock,
            TurnStatus::Complete => OutcomeCode::Complete,
            TurnStatus::Handoff => OutcomeCode::Handoff,
        }
    }
}

/// Codes surfaced to callers of the turn API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Ok,
    Deadlock,
    Complete,
    Handoff,
    ValidationError,
    ForkRejectedNotUserTurn,
    OrphanedNode,
}

impl OutcomeCode {
    /// Stable process exit code for CLI commands.
    pub fn exit_code(self) -> i32 {
        match self {
            OutcomeCode::Ok => exit_codes::OK,
            OutcomeCode::Deadlock => exit_codes::DEADLOCK,
            OutcomeCode::Complete => exit_codes::COMPLETE,
            OutcomeCode::Handoff => exit_codes::HANDOFF,
            OutcomeCode::ValidationError => exit_codes::VALIDATION_ERROR,
            OutcomeCode::ForkRejectedNotUserTurn => exit_codes::FORK_REJECTED_NOT_USER_TURN,
            OutcomeCode::OrphanedNode => exit_codes::ORPHANED_NODE,
        }
    }
}

/// Facts and gates that became available during a turn.
///
/// Lists are sorted so serialized outputs stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessDelta {
    pub added: Vec<FactName>,
    pub unlocked: Vec<GateName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_orders_high_above_low() {
        assert!(Importance::High > Importance::Normal);
        assert!(Importance::Normal > Importance::Low);
    }

    #[test]
    fn modes_serialize_screaming_case() {
        let json = serde_json::to_string(&Mode::Broaden).expect("serialize");
        assert_eq!(json, "\"BROADEN\"");
        let parsed: OnExhaust = serde_json::from_str("\"HANDOFF\"").expect("parse");
        assert_eq!(parsed, OnExhaust::Handoff);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        assert!(serde_json::from_str::<OnExhaust>("\"RETRY_FOREVER\"").is_err());
        assert!(serde_json::from_str::<Importance>("\"urgent\"").is_err());
    }

    #[test]
    fn variant_index_follows_strategy() {
        assert_eq!(PromptVariantStrategy::Fixed.variant_index(5), 0);
        assert_eq!(PromptVariantStrategy::Rotate.variant_index(4), 1);
        assert_eq!(PromptVariantStrategy::Escalate.variant_index(1), 1);
        assert_eq!(PromptVariantStrategy::Escalate.variant_index(9), 2);
    }

    #[test]
    fn outcome_codes_map_to_exit_codes() {
        assert_eq!(TurnStatus::Deadlock.outcome().exit_code(), exit_codes::DEADLOCK);
        assert_eq!(
            OutcomeCode::ForkRejectedNotUserTurn.exit_code(),
            exit_codes::FORK_REJECTED_NOT_USER_TURN
        );
    }
}
