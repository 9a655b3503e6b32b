//! Case file parsing and validation.
//!
//! Cases are TOML files describing a scripted conversation against a flow:
//! the turns to submit, what each turn should decide, and checks on the final
//! run. See `eval/cases/` for examples.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use flowrunner::core::types::{Mode, TurnStatus};
use flowrunner::io::config::PostGoalPolicy;
use serde::Deserialize;

/// A parsed case file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub config: CaseConfig,
    pub turns: Vec<TurnSpec>,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Case metadata.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Flow definition, relative to `eval/flows/`.
    pub flow: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

/// Controller configuration overrides for the case.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CaseConfig {
    pub stagnation_threshold: Option<u32>,
    pub post_goal_policy: Option<PostGoalPolicy>,
    pub divergence_label_chars: Option<usize>,
}

/// One scripted turn.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TurnSpec {
    pub message: Option<String>,
    /// Facts the (simulated) extractor reports for this turn.
    #[serde(default)]
    pub facts: Vec<String>,
    /// Branch label to continue; defaults to the root branch.
    pub branch: Option<String>,
    /// Fork before submitting; the turn runs on the new branch.
    pub fork: Option<ForkSpec>,
    pub expect_mode: Option<Mode>,
    pub expect_node: Option<String>,
    pub expect_status: Option<TurnStatus>,
}

/// Fork anchored at the node an earlier turn appended.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ForkSpec {
    /// 1-based index into `turns`.
    pub from_turn: usize,
    /// Branch label, also used by later turns' `branch`.
    pub label: String,
}

/// Verification check on the finished run.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// A canonical fact is known at the tip of a branch.
    FactPresent {
        fact: String,
        #[serde(default)]
        branch: Option<String>,
    },
    /// A gate is satisfied at the tip of a branch.
    GateSatisfied {
        gate: String,
        #[serde(default)]
        branch: Option<String>,
    },
    /// Number of branches in the run, root included.
    BranchCount { count: usize },
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(case)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        if self.case.flow.as_os_str().is_empty() {
            bail!("case.flow must be non-empty");
        }
        if let Some(threshold) = self.config.stagnation_threshold
            && threshold == 0
        {
            bail!("config.stagnation_threshold must be > 0");
        }
        if self.turns.is_empty() {
            bail!("turns must be a non-empty array");
        }
        let mut labels = BTreeSet::new();
        for (index, turn) in self.turns.iter().enumerate() {
            turn.validate(index + 1, &labels)
                .with_context(|| format!("turns[{}] invalid", index))?;
            if let Some(fork) = &turn.fork
                && !labels.insert(fork.label.clone())
            {
                bail!("turns[{}]: fork label '{}' reused", index, fork.label);
            }
        }
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate(&labels)
                .with_context(|| format!("checks[{}] invalid", index))?;
        }
        Ok(())
    }
}

impl TurnSpec {
    fn validate(&self, number: usize, labels: &BTreeSet<String>) -> Result<()> {
        if let Some(fork) = &self.fork {
            if self.branch.is_some() {
                bail!("fork and branch are mutually exclusive");
            }
            if fork.from_turn == 0 || fork.from_turn >= number {
                bail!("fork.from_turn must name an earlier turn (1..{})", number - 1);
            }
            if fork.label.trim().is_empty() {
                bail!("fork.label must be non-empty");
            }
        }
        if let Some(branch) = &self.branch
            && !labels.contains(branch)
        {
            bail!("branch '{}' is not forked by an earlier turn", branch);
        }
        Ok(())
    }
}

impl Check {
    fn validate(&self, labels: &BTreeSet<String>) -> Result<()> {
        let branch = match self {
            Check::FactPresent { fact, branch } => {
                if fact.trim().is_empty() {
                    bail!("fact_present.fact must be non-empty");
                }
                branch
            }
            Check::GateSatisfied { gate, branch } => {
                if gate.trim().is_empty() {
                    bail!("gate_satisfied.gate must be non-empty");
                }
                branch
            }
            Check::BranchCount { count } => {
                if *count == 0 {
                    bail!("branch_count.count must be > 0");
                }
                &None
            }
        };
        if let Some(branch) = branch
            && !labels.contains(branch)
        {
            bail!("branch '{}' is never forked", branch);
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<CaseFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        cases.push(CaseFile::load(&path)?);
    }
    cases.sort_by(|left, right| left.case.id.cmp(&right.case.id));
    for pair in cases.windows(2) {
        if pair[0].case.id == pair[1].case.id {
            return Err(anyhow!("duplicate case.id {}", pair[0].case.id));
        }
    }
    Ok(cases)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_case() {
        let input = r#"
[case]
id = "contact-escalation"
flow = "contact.json"

[config]
stagnation_threshold = 4
post_goal_policy = "high_importance_cleanup"

[[turns]]
message = "hi"
expect_mode = "EXECUTE"
expect_node = "contact-1"

[[turns]]
message = "email is john@x.com"
facts = ["email"]
fork = { from_turn = 1, label = "alt" }

[[turns]]
branch = "alt"
expect_status = "COMPLETE"

[[checks]]
type = "fact_present"
fact = "contact_email"
branch = "alt"

[[checks]]
type = "branch_count"
count = 2
"#;
        let case = CaseFile::parse_str(input).expect("case parses");
        assert_eq!(case.case.id, "contact-escalation");
        assert_eq!(case.turns.len(), 3);
        assert_eq!(case.turns[0].expect_mode, Some(Mode::Execute));
        assert_eq!(case.turns[2].expect_status, Some(TurnStatus::Complete));
        assert_eq!(
            case.config.post_goal_policy,
            Some(PostGoalPolicy::HighImportanceCleanup)
        );
        assert_eq!(case.checks.len(), 2);
    }

    #[test]
    fn rejects_invalid_id() {
        let input = r#"
[case]
id = "bad/id"
flow = "contact.json"

[[turns]]
message = "hi"
"#;
        let err = CaseFile::parse_str(input).expect_err("invalid id");
        assert!(err.to_string().contains("case.id"));
    }

    #[test]
    fn rejects_fork_from_later_turn() {
        let input = r#"
[case]
id = "bad-fork"
flow = "contact.json"

[[turns]]
message = "hi"
fork = { from_turn = 1, label = "alt" }
"#;
        let err = CaseFile::parse_str(input).expect_err("fork from self");
        assert!(format!("{err:#}").contains("from_turn"));
    }

    #[test]
    fn rejects_unknown_branch_reference() {
        let input = r#"
[case]
id = "bad-branch"
flow = "contact.json"

[[turns]]
message = "hi"
branch = "ghost"
"#;
        let err = CaseFile::parse_str(input).expect_err("unknown branch");
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[test]
    fn rejects_unknown_expectation_value() {
        let input = r#"
[case]
id = "bad-mode"
flow = "contact.json"

[[turns]]
expect_mode = "PANIC"
"#;
        assert!(CaseFile::parse_str(input).is_err());
    }
}
