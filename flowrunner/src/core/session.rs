//! Per-viewer session state for history navigation.
//!
//! Choosing a fork anchor only records intent. The branch is created later by
//! [`crate::run::Run::submit`] when the user actually sends a reply, so
//! abandoning a selection never leaves an empty branch behind.

use serde::{Deserialize, Serialize};

use crate::core::types::ExecNodeId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    fork_anchor: Option<ExecNodeId>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `node_id` as the anchor for the next submitted reply.
    pub fn select_fork_anchor(&mut self, node_id: impl Into<ExecNodeId>) {
        self.fork_anchor = Some(node_id.into());
    }

    pub fn clear_fork_anchor(&mut self) {
        self.fork_anchor = None;
    }

    pub fn fork_anchor(&self) -> Option<&str> {
        self.fork_anchor.as_deref()
    }

    /// Remove and return the pending anchor.
    pub fn take_fork_anchor(&mut self) -> Option<ExecNodeId> {
        self.fork_anchor.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selecting_anchor_is_pure_state() {
        let mut session = Session::new();
        session.select_fork_anchor("n000003");
        assert_eq!(session.fork_anchor(), Some("n000003"));
        session.select_fork_anchor("n000001");
        assert_eq!(session.fork_anchor(), Some("n000001"));
        session.clear_fork_anchor();
        assert_eq!(session.fork_anchor(), None);
    }

    #[test]
    fn take_consumes_anchor() {
        let mut session = Session::new();
        session.select_fork_anchor("n000002");
        assert_eq!(session.take_fork_anchor().as_deref(), Some("n000002"));
        assert!(session.take_fork_anchor().is_none());
    }
}
