//! Extraction seam between the controller and whatever interprets user replies.
//!
//! The [`Extractor`] trait decouples turn orchestration from the language-model
//! step that reads a reply and asserts raw facts. The controller only ever sees
//! raw fact names; aliasing and validation happen on its side of the seam.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::model::NodeDef;
use crate::core::types::{FactName, Mode};

/// Everything an extractor may look at for one turn.
#[derive(Debug, Clone)]
pub struct ExtractionRequest<'a> {
    pub node: &'a NodeDef,
    pub mode: Mode,
    pub user_message: Option<&'a str>,
    /// Canonical facts known before this turn.
    pub known_facts: &'a BTreeSet<FactName>,
    /// Prompt variant for the phrasing step (see `PromptVariantStrategy`).
    pub prompt_variant: u32,
}

/// Raw output of one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    /// Raw fact names; aliased and validated by the controller.
    #[serde(default)]
    pub facts: Vec<FactName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_message: Option<String>,
}

pub trait Extractor {
    /// Interpret the reply for `request.node`. An error aborts the turn.
    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<Extraction>;
}

/// Extracts nothing; every turn looks like an unhelpful reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractor;

impl Extractor for NoopExtractor {
    fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<Extraction> {
        Ok(Extraction::default())
    }
}

/// Reports a fixed fact list for whichever node is selected.
///
/// Used by the CLI `--fact` flag and the HTTP API, where the caller has
/// already interpreted the reply.
#[derive(Debug, Clone, Default)]
pub struct StaticExtractor {
    facts: Vec<FactName>,
    agent_message: Option<String>,
}

impl StaticExtractor {
    pub fn new(facts: Vec<FactName>) -> Self {
        Self {
            facts,
            agent_message: None,
        }
    }

    pub fn with_agent_message(mut self, message: impl Into<String>) -> Self {
        self.agent_message = Some(message.into());
        self
    }
}

impl Extractor for StaticExtractor {
    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<Extraction> {
        debug!(node = %request.node.id, mode = %request.mode, facts = ?self.facts, "static extraction");
        Ok(Extraction {
            facts: self.facts.clone(),
            agent_message: self.agent_message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::contact_flow;

    #[test]
    fn static_extractor_reports_fixed_facts() {
        let flow = contact_flow();
        let node = flow.node("contact-1").expect("node");
        let known = BTreeSet::new();
        let request = ExtractionRequest {
            node,
            mode: Mode::Execute,
            user_message: Some("john@x.com"),
            known_facts: &known,
            prompt_variant: 0,
        };
        let extraction = StaticExtractor::new(vec!["email".to_string()])
            .with_agent_message("Thanks!")
            .extract(&request)
            .expect("extract");
        assert_eq!(extraction.facts, vec!["email".to_string()]);
        assert_eq!(extraction.agent_message.as_deref(), Some("Thanks!"));
    }

    #[test]
    fn noop_extractor_reports_nothing() {
        let flow = contact_flow();
        let node = flow.node("book-1").expect("node");
        let known = BTreeSet::new();
        let request = ExtractionRequest {
            node,
            mode: Mode::Retry,
            user_message: None,
            known_facts: &known,
            prompt_variant: 1,
        };
        assert_eq!(
            NoopExtractor.extract(&request).expect("extract"),
            Extraction::default()
        );
    }
}
