//! Append-only execution history.
//!
//! Each committed turn becomes one immutable [`ExecutionNode`] linked to its
//! predecessor through `parent_id`. Branches share history by pointing at a
//! common ancestor; nothing is ever copied, mutated, or deleted.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BranchId, ExecNodeId, FactName, Mode, NodeId};
use crate::error::TreeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: ExecNodeId,
    /// `None` only for the first turn of the root branch.
    pub parent_id: Option<ExecNodeId>,
    pub branch_id: BranchId,
    /// Position along the path from the root (1-indexed).
    pub turn_number: u32,
    pub user_message: Option<String>,
    pub agent_message: Option<String>,
    /// Flow node selected for this turn.
    pub flow_node_id: NodeId,
    pub known_facts_before: BTreeSet<FactName>,
    pub known_facts_after: BTreeSet<FactName>,
    pub decision: Mode,
    pub reasoning: String,
    /// Record-only metadata; ordering is defined by `turn_number`.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionNode {
    pub fn has_user_message(&self) -> bool {
        self.user_message.is_some()
    }
}

/// Everything about a node except the id, which the store assigns.
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub parent_id: Option<ExecNodeId>,
    pub branch_id: BranchId,
    pub turn_number: u32,
    pub user_message: Option<String>,
    pub agent_message: Option<String>,
    pub flow_node_id: NodeId,
    pub known_facts_before: BTreeSet<FactName>,
    pub known_facts_after: BTreeSet<FactName>,
    pub decision: Mode,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// Run-scoped node store. Serializes as the plain node list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ExecutionNode>", into = "Vec<ExecutionNode>")]
pub struct History {
    nodes: Vec<ExecutionNode>,
    index: HashMap<ExecNodeId, usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted nodes, rejecting duplicate ids and
    /// parents that do not resolve.
    pub fn from_nodes(nodes: Vec<ExecutionNode>) -> Result<Self, TreeError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), idx).is_some() {
                return Err(TreeError::DuplicateNode {
                    node: node.id.clone(),
                });
            }
        }
        for node in &nodes {
            if let Some(parent) = &node.parent_id
                && !index.contains_key(parent)
            {
                return Err(TreeError::OrphanedNode {
                    node: node.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        Ok(Self { nodes, index })
    }

    /// Append a node. The parent must already exist.
    pub fn append(&mut self, draft: NodeDraft) -> Result<&ExecutionNode, TreeError> {
        let id = self.next_id();
        if let Some(parent) = &draft.parent_id
            && !self.index.contains_key(parent)
        {
            return Err(TreeError::OrphanedNode {
                node: id,
                parent: parent.clone(),
            });
        }
        let node = ExecutionNode {
            id: id.clone(),
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
            timestamp: draft.timestamp,
        };
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(id, idx);
        Ok(&self.nodes[idx])
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionNode> {
        self.index.get(id).map(|idx| &self.nodes[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All nodes in append order.
    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Most recently appended node on `branch`, if any.
    pub fn leaf_of_branch(&self, branch: &str) -> Option<&ExecutionNode> {
        self.nodes.iter().rev().find(|node| node.branch_id == branch)
    }

    fn next_id(&self) -> ExecNodeId {
        let mut seq = self.nodes.len() + 1;
        loop {
            let id = format!("n{seq:06}");
            if !self.index.contains_key(&id) {
                return id;
            }
            seq += 1;
        }
    }
}

impl TryFrom<Vec<ExecutionNode>> for History {
    type Error = TreeError;

    fn try_from(nodes: Vec<ExecutionNode>) -> Result<Self, Self::Error> {
        Self::from_nodes(nodes)
    }
}

impl From<History> for Vec<ExecutionNode> {
    fn from(history: History) -> Self {
        history.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::draft;

    #[test]
    fn append_assigns_sequential_ids() {
        let mut history = History::new();
        let first = history
            .append(draft(None, "main", 1, Some("hi")))
            .expect("append")
            .id
            .clone();
        let second = history
            .append(draft(Some(&first), "main", 2, None))
            .expect("append")
            .id
            .clone();
        assert_eq!(first, "n000001");
        assert_eq!(second, "n000002");
        assert_eq!(
            history.get(&second).and_then(|n| n.parent_id.clone()),
            Some(first)
        );
    }

    #[test]
    fn append_rejects_unknown_parent() {
        let mut history = History::new();
        let err = history
            .append(draft(Some("n999999"), "main", 1, None))
            .expect_err("orphan");
        assert!(matches!(err, TreeError::OrphanedNode { .. }));
        assert!(history.is_empty());
    }

    #[test]
    fn leaf_of_branch_returns_last_appended() {
        let mut history = History::new();
        history
            .append(draft(None, "main", 1, Some("a")))
            .expect("append");
        history
            .append(draft(Some("n000001"), "main", 2, Some("b")))
            .expect("append");
        history
            .append(draft(Some("n000001"), "branch-1", 2, Some("c")))
            .expect("append");
        assert_eq!(
            history.leaf_of_branch("main").map(|n| n.id.as_str()),
            Some("n000002")
        );
        assert!(history.leaf_of_branch("branch-9").is_none());
        assert_eq!(
            history.leaf_of_branch("branch-1").map(|n| n.id.as_str()),
            Some("n000003")
        );
    }

    #[test]
    fn serde_round_trip_rejects_duplicates() {
        let mut history = History::new();
        history
            .append(draft(None, "main", 1, Some("a")))
            .expect("append");
        let mut nodes: Vec<ExecutionNode> = history.clone().into();
        nodes.push(nodes[0].clone());
        let json = serde_json::to_string(&nodes).expect("serialize");
        let parsed: Result<History, _> = serde_json::from_str(&json);
        assert!(parsed.is_err());
    }
}
