//! Typed errors for the flow controller.
//!
//! Compile and fork errors are rejected before any state mutation; tree
//! errors report history integrity problems. Orchestration code wraps these
//! in `anyhow` and the CLI downcasts them to choose an exit code.

use thiserror::Error;

use crate::core::types::{ExecNodeId, OutcomeCode};

/// A single fatal problem in a flow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("duplicate node id '{node}'")]
    DuplicateNode { node: String },
    #[error("node '{node}' references undefined gate '{gate}'")]
    UndefinedGate { node: String, gate: String },
    #[error("primary goal references undefined gate '{gate}'")]
    UndefinedGoalGate { gate: String },
    #[error("primary goal of type {kind} is missing its '{field}' name")]
    MissingGoalTarget { kind: String, field: String },
    #[error("flow declares no entry nodes")]
    NoEntryNodes,
    #[error("entry node '{node}' is not defined")]
    UnknownEntryNode { node: String },
    #[error("node patch targets unknown node '{node}'")]
    UnknownPatchTarget { node: String },
    #[error("malformed fact name '{fact}' in {context} (expected ^[a-z0-9_.]+$)")]
    MalformedFactName { fact: String, context: String },
    #[error("node '{node}': retryPolicy.maxAttempts must be > 0")]
    InvalidRetryPolicy { node: String },
    #[error("node '{node}': runPolicy.maxExecutions must be > 0")]
    InvalidRunPolicy { node: String },
}

/// Every compile error found in one pass, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flow failed to compile:\n- {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n- "))]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn errors(&self) -> &[CompileError] {
        &self.0
    }
}

/// Fork preconditions that were not met. No branch is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkError {
    #[error("cannot fork from unknown node '{node}'")]
    UnknownNode { node: ExecNodeId },
    #[error("cannot fork from node '{node}': forks are anchored at user turns only")]
    NotUserTurn { node: ExecNodeId },
}

impl ForkError {
    pub fn outcome(&self) -> OutcomeCode {
        match self {
            ForkError::UnknownNode { .. } => OutcomeCode::ValidationError,
            ForkError::NotUserTurn { .. } => OutcomeCode::ForkRejectedNotUserTurn,
        }
    }
}

/// Execution history integrity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node '{node}' references missing parent '{parent}'")]
    OrphanedNode { node: ExecNodeId, parent: ExecNodeId },
    #[error("duplicate execution node id '{node}'")]
    DuplicateNode { node: ExecNodeId },
    #[error("parent links form a cycle through: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<ExecNodeId> },
    #[error("unknown execution node '{node}'")]
    UnknownNode { node: ExecNodeId },
}

impl TreeError {
    pub fn outcome(&self) -> OutcomeCode {
        match self {
            TreeError::OrphanedNode { .. } | TreeError::Cycle { .. } => OutcomeCode::OrphanedNode,
            TreeError::DuplicateNode { .. } | TreeError::UnknownNode { .. } => {
                OutcomeCode::ValidationError
            }
        }
    }
}

/// A turn request that cannot be applied to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("unknown branch '{branch}'")]
    UnknownBranch { branch: String },
    #[error("unknown cursor node '{cursor}'")]
    UnknownCursor { cursor: ExecNodeId },
    #[error("cursor '{cursor}' is not the leaf of branch '{branch}' (leaf is {leaf}); fork to continue from an earlier turn")]
    StaleCursor {
        cursor: ExecNodeId,
        branch: String,
        leaf: String,
    },
    #[error("no state checkpoint recorded for node '{node}'")]
    MissingCheckpoint { node: ExecNodeId },
}

/// Map an error chain to the outcome code reported to callers.
pub fn outcome_for_error(err: &anyhow::Error) -> OutcomeCode {
    if let Some(fork) = err.downcast_ref::<ForkError>() {
        return fork.outcome();
    }
    if let Some(tree) = err.downcast_ref::<TreeError>() {
        return tree.outcome();
    }
    OutcomeCode::ValidationError
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn compile_errors_list_every_problem() {
        let errors = CompileErrors(vec![
            CompileError::NoEntryNodes,
            CompileError::UndefinedGate {
                node: "a".to_string(),
                gate: "G".to_string(),
            },
        ]);
        let text = errors.to_string();
        assert!(text.contains("no entry nodes"));
        assert!(text.contains("undefined gate 'G'"));
    }

    /// Context layers must not hide the typed error from exit-code mapping.
    #[test]
    fn outcome_downcasts_through_context() {
        let err = Err::<(), _>(ForkError::NotUserTurn {
            node: "n000002".to_string(),
        })
        .context("fork run")
        .expect_err("error");
        assert_eq!(outcome_for_error(&err), OutcomeCode::ForkRejectedNotUserTurn);

        let orphan = anyhow::Error::new(TreeError::OrphanedNode {
            node: "n2".to_string(),
            parent: "n1".to_string(),
        });
        assert_eq!(outcome_for_error(&orphan), OutcomeCode::OrphanedNode);
    }
}
