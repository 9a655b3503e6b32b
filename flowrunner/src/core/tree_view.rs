//! Divergence-aware tree materialization of execution history.
//!
//! [`build_tree`] turns the flat parent-pointer list into a [`Forest`]: an
//! arena of nodes in preorder whose children are arena indices. Building,
//! labelling, rendering, and serializing all walk the arena with explicit
//! stacks or index order, so a conversation of any length is safe to show.
//!
//! A node with more than one child that carries a user message is a
//! divergence point; its extra children are alternate paths labelled by
//! their first user message.

use std::collections::HashMap;

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::core::history::ExecutionNode;
use crate::core::types::{BranchId, ExecNodeId};
use crate::error::TreeError;

/// Default maximum characters kept from a user message in alternate labels.
pub const DEFAULT_LABEL_CHARS: usize = 40;

/// One arena entry; `children` index into the owning [`Forest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode<'a> {
    pub node: &'a ExecutionNode,
    pub children: Vec<usize>,
    pub divergence: Option<Divergence>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Divergence {
    /// Continuation on the same branch (or the earliest child if none).
    pub main_child: ExecNodeId,
    pub alternates: Vec<AlternatePath>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AlternatePath {
    pub child: ExecNodeId,
    pub branch: BranchId,
    pub label: String,
}

/// Flat forest in preorder: every parent precedes its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Forest<'a> {
    nodes: Vec<TreeNode<'a>>,
    roots: Vec<usize>,
}

impl<'a> Forest<'a> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &TreeNode<'a>> {
        self.roots.iter().map(|&index| &self.nodes[index])
    }

    pub fn children(&self, tree_node: &TreeNode<'a>) -> impl Iterator<Item = &TreeNode<'a>> {
        tree_node.children.iter().map(|&index| &self.nodes[index])
    }

    /// Arena entry for an execution node id.
    pub fn find(&self, id: &str) -> Option<&TreeNode<'a>> {
        self.nodes.iter().find(|tree_node| tree_node.node.id == id)
    }

    /// Nodes in preorder.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode<'a>> {
        self.nodes.iter()
    }
}

/// Serialized flat: `roots` are ids and each node lists its children by id,
/// so the JSON depth stays constant however long the conversation is.
impl Serialize for Forest<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(serde::Serialize)]
        struct Entry<'f> {
            node: &'f ExecutionNode,
            children: Vec<&'f str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            divergence: Option<&'f Divergence>,
        }

        let roots: Vec<&str> = self.roots().map(|root| root.node.id.as_str()).collect();
        let entries: Vec<Entry<'_>> = self
            .nodes
            .iter()
            .map(|tree_node| Entry {
                node: tree_node.node,
                children: self
                    .children(tree_node)
                    .map(|child| child.node.id.as_str())
                    .collect(),
                divergence: tree_node.divergence.as_ref(),
            })
            .collect();
        let mut state = serializer.serialize_struct("Forest", 2)?;
        state.serialize_field("roots", &roots)?;
        state.serialize_field("nodes", &entries)?;
        state.end()
    }
}

/// Build a forest from execution nodes.
///
/// Children are ordered by `(timestamp, id)`. Orphans, duplicate ids, and
/// cycles are integrity errors; an orphan is never promoted to a root.
pub fn build_tree(nodes: &[ExecutionNode], label_chars: usize) -> Result<Forest<'_>, TreeError> {
    let mut by_id: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        if by_id.insert(node.id.as_str(), index).is_some() {
            return Err(TreeError::DuplicateNode {
                node: node.id.clone(),
            });
        }
    }

    let mut roots: Vec<usize> = Vec::new();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        match &node.parent_id {
            None => roots.push(index),
            Some(parent) => {
                let Some(&parent_index) = by_id.get(parent.as_str()) else {
                    return Err(TreeError::OrphanedNode {
                        node: node.id.clone(),
                        parent: parent.clone(),
                    });
                };
                children[parent_index].push(index);
            }
        }
    }
    for list in &mut children {
        sort_presentation(nodes, list);
    }
    sort_presentation(nodes, &mut roots);

    // Preorder walk; `slot_of` maps input position to arena index.
    let mut slot_of: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut order: Vec<usize> = Vec::with_capacity(nodes.len());
    let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
    while let Some(index) = stack.pop() {
        slot_of[index] = Some(order.len());
        order.push(index);
        stack.extend(children[index].iter().rev().copied());
    }

    // Anything not reached from a root sits on a parent cycle.
    if order.len() != nodes.len() {
        let mut stuck: Vec<ExecNodeId> = nodes
            .iter()
            .zip(&slot_of)
            .filter(|(_, slot)| slot.is_none())
            .map(|(node, _)| node.id.clone())
            .collect();
        stuck.sort();
        return Err(TreeError::Cycle { nodes: stuck });
    }

    let slot = |index: usize| slot_of[index].unwrap_or_default();
    let mut arena: Vec<TreeNode<'_>> = order
        .iter()
        .map(|&index| TreeNode {
            node: &nodes[index],
            children: children[index].iter().map(|&child| slot(child)).collect(),
            divergence: None,
        })
        .collect();

    // Children sit after their parent in preorder, so a reverse sweep sees
    // every child's label before the parent asks for it.
    let mut first_message: Vec<Option<&str>> = vec![None; arena.len()];
    for index in (0..arena.len()).rev() {
        let tree_node = &arena[index];
        let label = match tree_node.node.user_message.as_deref() {
            Some(message) => Some(message),
            None => tree_node
                .children
                .first()
                .and_then(|&child| first_message[child]),
        };
        first_message[index] = label;
    }

    for index in 0..arena.len() {
        let divergence = detect_divergence(&arena, index, &first_message, label_chars);
        arena[index].divergence = divergence;
    }

    Ok(Forest {
        nodes: arena,
        roots: roots.into_iter().map(slot).collect(),
    })
}

fn sort_presentation(nodes: &[ExecutionNode], list: &mut [usize]) {
    list.sort_by(|&a, &b| {
        let (a, b) = (&nodes[a], &nodes[b]);
        a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
    });
}

fn detect_divergence(
    arena: &[TreeNode<'_>],
    index: usize,
    first_message: &[Option<&str>],
    label_chars: usize,
) -> Option<Divergence> {
    let tree_node = &arena[index];
    let node = tree_node.node;
    if tree_node.children.len() < 2 || !node.has_user_message() {
        return None;
    }
    let main_child = tree_node
        .children
        .iter()
        .copied()
        .find(|&child| {
            let child = arena[child].node;
            child.branch_id == node.branch_id && child.turn_number == node.turn_number + 1
        })
        .unwrap_or(tree_node.children[0]);
    let alternates = tree_node
        .children
        .iter()
        .copied()
        .filter(|&child| child != main_child)
        .map(|child| AlternatePath {
            child: arena[child].node.id.clone(),
            branch: arena[child].node.branch_id.clone(),
            label: match first_message[child] {
                Some(message) => truncate_label(message, label_chars),
                None => "(no reply yet)".to_string(),
            },
        })
        .collect();
    Some(Divergence {
        main_child: arena[main_child].node.id.clone(),
        alternates,
    })
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_label(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

/// Render a forest as indented text for terminals.
///
/// Indentation only grows where the tree branches; an only child continues
/// at its parent's column.
pub fn render_tree(forest: &Forest<'_>) -> String {
    let mut out = String::new();
    // (arena index, leading text for this line, prefix for lines below it)
    let mut stack: Vec<(usize, String, String)> = forest
        .roots
        .iter()
        .rev()
        .map(|&root| (root, String::new(), String::new()))
        .collect();
    while let Some((index, lead, prefix)) = stack.pop() {
        let tree_node = &forest.nodes[index];
        render_line(tree_node, &lead, &mut out);
        match tree_node.children.as_slice() {
            [] => {}
            [only] => stack.push((*only, prefix.clone(), prefix)),
            many => {
                let last = many.len() - 1;
                for (position, &child) in many.iter().enumerate().rev() {
                    let (connector, indent) = if position == last {
                        ("└── ", "    ")
                    } else {
                        ("├── ", "│   ")
                    };
                    let lead = format!("{prefix}{connector}");
                    stack.push((child, lead, format!("{prefix}{indent}")));
                }
            }
        }
    }
    out
}

fn render_line(tree_node: &TreeNode<'_>, lead: &str, out: &mut String) {
    let node = tree_node.node;
    out.push_str(&format!(
        "{lead}{} [{}#{}] {} {}",
        node.id, node.branch_id, node.turn_number, node.decision, node.flow_node_id
    ));
    if let Some(message) = &node.user_message {
        out.push_str(&format!(" | user: {:?}", truncate_label(message, DEFAULT_LABEL_CHARS)));
    }
    if let Some(divergence) = &tree_node.divergence {
        out.push_str(&format!(" (diverges: {} alternate", divergence.alternates.len()));
        if divergence.alternates.len() != 1 {
            out.push('s');
        }
        out.push(')');
    }
    out.push('\n');
}
