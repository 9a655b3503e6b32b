//! Branch bookkeeping and ancestry reconstruction.
//!
//! A fork only records where a branch diverges. Turns submitted on the new
//! branch attach to the anchor node, which is enough for the tree builder to
//! share history without copying it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::history::{ExecutionNode, History};
use crate::core::types::{BranchId, ExecNodeId};
use crate::error::{ForkError, TreeError};

/// Id of the branch every run starts on.
pub const ROOT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: BranchId,
    /// `None` only for the root branch.
    pub parent_branch_id: Option<BranchId>,
    /// User-message node this branch diverges from; `None` only for the root branch.
    pub fork_from_node_id: Option<ExecNodeId>,
    pub label: String,
}

impl Branch {
    pub fn is_root(&self) -> bool {
        self.parent_branch_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchManager {
    branches: BTreeMap<BranchId, Branch>,
    forks_created: u32,
}

impl Default for BranchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchManager {
    /// Create a manager holding only the root branch.
    pub fn new() -> Self {
        let root = Branch {
            branch_id: ROOT_BRANCH.to_string(),
            parent_branch_id: None,
            fork_from_node_id: None,
            label: ROOT_BRANCH.to_string(),
        };
        Self {
            branches: BTreeMap::from([(root.branch_id.clone(), root)]),
            forks_created: 0,
        }
    }

    pub fn get(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Create a branch anchored at a user-message node.
    ///
    /// Rejected without side effects when the anchor does not exist or has no
    /// user message (agent output is never branched).
    pub fn fork(
        &mut self,
        history: &History,
        anchor_node_id: &str,
        label: &str,
    ) -> Result<&Branch, ForkError> {
        let anchor = fork_anchor(history, anchor_node_id)?;
        let branch_id = self.next_branch_id();
        let branch = Branch {
            branch_id: branch_id.clone(),
            parent_branch_id: Some(anchor.branch_id.clone()),
            fork_from_node_id: Some(anchor.id.clone()),
            label: label.to_string(),
        };
        info!(branch = %branch_id, anchor = %anchor.id, "branch forked");
        self.forks_created += 1;
        Ok(self.branches.entry(branch_id).or_insert(branch))
    }

    fn next_branch_id(&self) -> BranchId {
        let mut seq = self.forks_created + 1;
        loop {
            let id = format!("branch-{seq}");
            if !self.branches.contains_key(&id) {
                return id;
            }
            seq += 1;
        }
    }
}

/// The node a fork from `anchor_node_id` would continue from.
///
/// Fails when the node does not exist or has no user message (agent output
/// is never branched).
pub fn fork_anchor<'a>(
    history: &'a History,
    anchor_node_id: &str,
) -> Result<&'a ExecutionNode, ForkError> {
    let anchor = history
        .get(anchor_node_id)
        .ok_or_else(|| ForkError::UnknownNode {
            node: anchor_node_id.to_string(),
        })?;
    if !anchor.has_user_message() {
        return Err(ForkError::NotUserTurn {
            node: anchor_node_id.to_string(),
        });
    }
    Ok(anchor)
}

/// Root-first chain of nodes from a root to `node_id`, following parent links.
///
/// This is exactly "the conversation so far" for a selection: sibling branches
/// never appear in it.
pub fn ancestry_chain<'a>(
    history: &'a History,
    node_id: &str,
) -> Result<Vec<&'a ExecutionNode>, TreeError> {
    let mut current = history.get(node_id).ok_or_else(|| TreeError::UnknownNode {
        node: node_id.to_string(),
    })?;
    let mut chain = vec![current];
    while let Some(parent_id) = &current.parent_id {
        let parent = history.get(parent_id).ok_or_else(|| TreeError::OrphanedNode {
            node: current.id.clone(),
            parent: parent_id.clone(),
        })?;
        if chain.len() > history.len() {
            let mut nodes: Vec<ExecNodeId> = chain.iter().map(|node| node.id.clone()).collect();
            nodes.sort();
            nodes.dedup();
            return Err(TreeError::Cycle { nodes });
        }
        chain.push(parent);
        current = parent;
    }
    chain.reverse();
    Ok(chain)
}
