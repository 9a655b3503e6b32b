//! Fact canonicalization and merging.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::core::model::FlowModel;
use crate::core::state::RuntimeState;
use crate::core::types::FactName;

static FACT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.]+$").expect("fact name pattern is valid"));

/// True if `name` is a well-formed fact name (`^[a-z0-9_.]+$`).
pub fn is_valid_fact_name(name: &str) -> bool {
    FACT_NAME.is_match(name)
}

/// Map a raw fact to its canonical name (identity when unmapped).
pub fn canonicalize<'a>(flow: &'a FlowModel, raw: &'a str) -> &'a str {
    flow.alias(raw).unwrap_or(raw)
}

/// Canonicalize raw facts and union them into the state.
///
/// Returns the canonical facts that were not already known, sorted. Malformed
/// names are dropped with a warning; validation errors belong to compile time.
/// Re-applying the same input is a no-op.
pub fn merge_facts<I, S>(flow: &FlowModel, state: &mut RuntimeState, raw: I) -> Vec<FactName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut added = Vec::new();
    for fact in raw {
        let fact = fact.as_ref().trim();
        if !is_valid_fact_name(fact) {
            warn!(fact, "dropping malformed fact name from extraction");
            continue;
        }
        let canonical = canonicalize(flow, fact);
        if state.insert_fact(canonical) {
            added.push(canonical.to_string());
        }
    }
    added.sort();
    added
}
