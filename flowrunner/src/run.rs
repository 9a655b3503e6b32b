//! Turn API over one conversation run: step, fork, and history views.
//!
//! A run owns its history, branches, and the [`TurnRecord`] committed with
//! each execution node. A path's [`RuntimeState`] is the fold of the records
//! from the root to its leaf, so every path accumulates its own counters and
//! facts while storage stays linear in the number of turns. The flow model is
//! shared read-only across runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{Controller, Decision, Turn};
use crate::core::branches::{BranchManager, ROOT_BRANCH, ancestry_chain, fork_anchor};
use crate::core::history::{ExecutionNode, History, NodeDraft};
use crate::core::model::FlowModel;
use crate::core::session::Session;
use crate::core::state::{RuntimeState, TurnRecord};
use crate::core::tree_view::{Forest, build_tree, render_tree, truncate_label};
use crate::core::types::{BranchId, ExecNodeId, OutcomeCode, ReadinessDelta, TurnStatus};
use crate::error::{ForkError, StepError, TreeError};
use crate::io::config::ControllerConfig;
use crate::io::extractor::Extractor;

/// Source of record-only timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where and what to submit for one turn.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub branch: &'a str,
    /// Must equal the branch leaf when given; `None` means "the leaf".
    pub cursor: Option<&'a str>,
    pub user_message: Option<&'a str>,
}

impl<'a> StepRequest<'a> {
    pub fn on(branch: &'a str) -> Self {
        Self {
            branch,
            cursor: None,
            user_message: None,
        }
    }

    pub fn message(mut self, text: &'a str) -> Self {
        self.user_message = Some(text);
        self
    }

    pub fn cursor(mut self, node: &'a str) -> Self {
        self.cursor = Some(node);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub status: TurnStatus,
    pub outcome: OutcomeCode,
    pub branch_id: BranchId,
    pub new_nodes: Vec<ExecutionNode>,
    pub readiness_delta: ReadinessDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkResult {
    pub branch_id: BranchId,
    /// The anchor: the node the new branch continues from.
    pub leaf_node_id: ExecNodeId,
}

/// Serializable form of a run, without the flow model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: String,
    pub flow_version: String,
    pub config: ControllerConfig,
    pub branches: BranchManager,
    /// Plain node list; integrity is re-checked by [`Run::from_snapshot`].
    pub history: Vec<ExecutionNode>,
    /// Turn record committed with each node; states are replayed from these.
    pub checkpoints: BTreeMap<ExecNodeId, TurnRecord>,
}

#[derive(Debug, Clone)]
pub struct Run {
    id: String,
    flow: Arc<FlowModel>,
    config: ControllerConfig,
    history: History,
    branches: BranchManager,
    checkpoints: BTreeMap<ExecNodeId, TurnRecord>,
    /// Replayed states of current branch tips; rebuilt on demand.
    tips: BTreeMap<ExecNodeId, RuntimeState>,
}

impl Run {
    pub fn new(id: impl Into<String>, flow: Arc<FlowModel>, config: ControllerConfig) -> Self {
        Self {
            id: id.into(),
            flow,
            config,
            history: History::new(),
            branches: BranchManager::new(),
            checkpoints: BTreeMap::new(),
            tips: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flow(&self) -> &Arc<FlowModel> {
        &self.flow
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Replace the controller config for subsequent turns.
    pub fn set_config(&mut self, config: ControllerConfig) {
        self.config = config;
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    /// Node a new turn on `branch` would attach to.
    ///
    /// The latest node on the branch, else its fork anchor; `None` for an
    /// empty root branch or an unknown branch.
    pub fn branch_leaf(&self, branch: &str) -> Option<&str> {
        if let Some(node) = self.history.leaf_of_branch(branch) {
            return Some(node.id.as_str());
        }
        self.branches
            .get(branch)
            .and_then(|b| b.fork_from_node_id.as_deref())
    }

    /// State after `node`'s turn committed.
    pub fn state_at(&self, node: &str) -> Option<RuntimeState> {
        if !self.history.contains(node) {
            return None;
        }
        self.replay_to(node).ok()
    }

    /// Current state at the tip of `branch`.
    pub fn branch_state(&self, branch: &str) -> Result<RuntimeState, StepError> {
        if self.branches.get(branch).is_none() {
            return Err(StepError::UnknownBranch {
                branch: branch.to_string(),
            });
        }
        match self.branch_leaf(branch) {
            Some(leaf) => self.replay_to(leaf),
            None => Ok(RuntimeState::new()),
        }
    }

    /// Fold turn records from the nearest cached tip (or the root) to `node`.
    fn replay_to(&self, node: &str) -> Result<RuntimeState, StepError> {
        let mut pending: Vec<&TurnRecord> = Vec::new();
        let mut state = RuntimeState::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if let Some(tip) = self.tips.get(id) {
                state = tip.clone();
                break;
            }
            let record = self
                .checkpoints
                .get(id)
                .ok_or_else(|| StepError::MissingCheckpoint { node: id.to_string() })?;
            pending.push(record);
            cursor = self
                .history
                .get(id)
                .and_then(|node| node.parent_id.as_deref());
        }
        for record in pending.into_iter().rev() {
            state.apply_record(record.clone());
        }
        Ok(state)
    }

    /// Run one controller turn on a branch and commit it atomically.
    pub fn step(
        &mut self,
        request: StepRequest<'_>,
        extractor: &dyn Extractor,
        clock: &dyn Clock,
    ) -> Result<StepResult> {
        let branch = request.branch;
        let before = self.branch_state(branch)?;
        let leaf = self.branch_leaf(branch).map(ToString::to_string);
        if let Some(cursor) = request.cursor {
            if !self.history.contains(cursor) {
                return Err(StepError::UnknownCursor {
                    cursor: cursor.to_string(),
                }
                .into());
            }
            if leaf.as_deref() != Some(cursor) {
                return Err(StepError::StaleCursor {
                    cursor: cursor.to_string(),
                    branch: branch.to_string(),
                    leaf: leaf.unwrap_or_else(|| "(none)".to_string()),
                }
                .into());
            }
        }

        let turn = self.run_turn(&before, branch, request.user_message, extractor)?;
        if !turn.committed() {
            return Ok(uncommitted(branch, turn));
        }
        self.commit(branch, leaf, &before, turn, request.user_message, clock)
    }

    fn run_turn(
        &self,
        before: &RuntimeState,
        branch: &str,
        user_message: Option<&str>,
        extractor: &dyn Extractor,
    ) -> Result<Turn> {
        Controller::new(&self.flow, &self.config)
            .turn(before, user_message, extractor)
            .with_context(|| format!("run {} branch {branch}", self.id))
    }

    /// Append the node for a committed turn and keep its record.
    fn commit(
        &mut self,
        branch: &str,
        leaf: Option<ExecNodeId>,
        before: &RuntimeState,
        turn: Turn,
        user_message: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<StepResult> {
        let decision = turn
            .decision
            .clone()
            .context("committed turn carries no decision")?;
        let record = turn
            .state
            .turn_log()
            .last()
            .cloned()
            .context("committed turn carries no turn record")?;

        let node = self
            .history
            .append(NodeDraft {
                parent_id: leaf.clone(),
                branch_id: branch.to_string(),
                turn_number: turn.state.turns_committed(),
                user_message: user_message.map(ToString::to_string),
                agent_message: turn.agent_message.clone(),
                flow_node_id: decision.flow_node.clone(),
                known_facts_before: before.facts().clone(),
                known_facts_after: turn.state.facts().clone(),
                decision: decision.mode,
                reasoning: decision.reasoning.clone(),
                timestamp: clock.now(),
            })?
            .clone();
        self.checkpoints.insert(node.id.clone(), record);
        if let Some(leaf) = leaf
            && !self.is_tip(&leaf)
        {
            self.tips.remove(&leaf);
        }
        self.tips.insert(node.id.clone(), turn.state);

        Ok(StepResult {
            status: turn.status,
            outcome: turn.status.outcome(),
            branch_id: branch.to_string(),
            new_nodes: vec![node],
            readiness_delta: turn.delta,
            decision: Some(decision),
        })
    }

    /// Some branch would still attach its next turn to `node`.
    fn is_tip(&self, node: &str) -> bool {
        self.branches
            .branches()
            .any(|branch| self.branch_leaf(&branch.branch_id) == Some(node))
    }

    /// Create a branch anchored at a user-message node.
    pub fn fork(&mut self, from: &str, label: &str) -> Result<ForkResult, ForkError> {
        let branch = self.branches.fork(&self.history, from, label)?;
        Ok(ForkResult {
            branch_id: branch.branch_id.clone(),
            leaf_node_id: from.to_string(),
        })
    }

    /// Submit a reply from a viewer session.
    ///
    /// A pending fork anchor turns the reply into the first turn of a new
    /// branch labelled after the reply; otherwise the reply continues
    /// `branch`. The branch is created, and the anchor consumed, only when
    /// the turn commits; a failed or terminal turn leaves both as they were.
    pub fn submit(
        &mut self,
        session: &mut Session,
        branch: &str,
        message: &str,
        extractor: &dyn Extractor,
        clock: &dyn Clock,
    ) -> Result<StepResult> {
        let Some(anchor) = session.fork_anchor().map(ToString::to_string) else {
            return self.step(StepRequest::on(branch).message(message), extractor, clock);
        };
        fork_anchor(&self.history, &anchor)?;
        let before = self.replay_to(&anchor)?;
        let turn = self.run_turn(&before, &anchor, Some(message), extractor)?;
        if !turn.committed() {
            debug!(anchor = %anchor, status = ?turn.status, "fork held back");
            return Ok(uncommitted(branch, turn));
        }

        let label = truncate_label(message, self.config.divergence_label_chars);
        let fork = self.fork(&anchor, &label)?;
        session.take_fork_anchor();
        self.commit(&fork.branch_id, Some(anchor), &before, turn, Some(message), clock)
    }

    /// Divergence-aware forest over every node in the run.
    pub fn tree(&self) -> Result<Forest<'_>, TreeError> {
        build_tree(self.history.nodes(), self.config.divergence_label_chars)
    }

    pub fn render_tree(&self) -> Result<String, TreeError> {
        Ok(render_tree(&self.tree()?))
    }

    /// The conversation so far, root first, as seen from `node`.
    pub fn ancestry(&self, node: &str) -> Result<Vec<&ExecutionNode>, TreeError> {
        ancestry_chain(&self.history, node)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            id: self.id.clone(),
            flow_version: self.flow.version().to_string(),
            config: self.config.clone(),
            branches: self.branches.clone(),
            history: self.history.nodes().to_vec(),
            checkpoints: self.checkpoints.clone(),
        }
    }

    /// Rebuild a run, re-checking tree integrity and checkpoint coverage.
    pub fn from_snapshot(snapshot: RunSnapshot, flow: Arc<FlowModel>) -> Result<Self> {
        if snapshot.flow_version != flow.version() {
            warn!(
                run = %snapshot.id,
                saved = %snapshot.flow_version,
                current = %flow.version(),
                "run was recorded against a different flow version"
            );
        }
        let history = History::from_nodes(snapshot.history)
            .with_context(|| format!("run {} history integrity", snapshot.id))?;
        build_tree(history.nodes(), snapshot.config.divergence_label_chars)
            .with_context(|| format!("run {} history integrity", snapshot.id))?;
        if let Some(node) = history
            .nodes()
            .iter()
            .find(|node| !snapshot.checkpoints.contains_key(&node.id))
        {
            return Err(StepError::MissingCheckpoint {
                node: node.id.clone(),
            })
            .with_context(|| format!("run {}", snapshot.id));
        }
        if snapshot.branches.get(ROOT_BRANCH).is_none() {
            return Err(StepError::UnknownBranch {
                branch: ROOT_BRANCH.to_string(),
            })
            .with_context(|| format!("run {}", snapshot.id));
        }
        info!(run = %snapshot.id, nodes = history.len(), "run restored");
        Ok(Self {
            id: snapshot.id,
            flow,
            config: snapshot.config,
            history,
            branches: snapshot.branches,
            checkpoints: snapshot.checkpoints,
            tips: BTreeMap::new(),
        })
    }
}

/// Result for a turn that committed nothing (terminal status).
fn uncommitted(branch: &str, turn: Turn) -> StepResult {
    StepResult {
        status: turn.status,
        outcome: turn.status.outcome(),
        branch_id: branch.to_string(),
        new_nodes: Vec::new(),
        readiness_delta: turn.delta,
        decision: None,
    }
}
