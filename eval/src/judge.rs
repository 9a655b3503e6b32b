//! Expectation and check evaluation.
//!
//! Compares each turn's decision with the case's expectations and runs the
//! final-state checks against the finished run.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use flowrunner::core::branches::ROOT_BRANCH;
use flowrunner::core::types::{BranchId, ExecNodeId, Mode, OutcomeCode, TurnStatus};
use flowrunner::run::{Run, StepResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::case::{Check, TurnSpec};

/// What one scripted turn did, and how it differed from expectations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnOutcome {
    /// 1-based position in the case.
    pub turn: usize,
    pub branch_id: BranchId,
    pub status: TurnStatus,
    pub outcome: OutcomeCode,
    pub mode: Option<Mode>,
    pub flow_node: Option<String>,
    pub exec_node: Option<ExecNodeId>,
    pub mismatches: Vec<String>,
}

impl TurnOutcome {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Result of running a single check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckOutcome {
    FactPresent {
        fact: String,
        branch: String,
        passed: bool,
    },
    GateSatisfied {
        gate: String,
        branch: String,
        passed: bool,
    },
    BranchCount {
        expected: usize,
        actual: usize,
        passed: bool,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CheckOutcome::FactPresent { passed, .. }
            | CheckOutcome::GateSatisfied { passed, .. }
            | CheckOutcome::BranchCount { passed, .. } => *passed,
        }
    }

    /// Stable label used to group pass rates across runs.
    pub fn label(&self) -> String {
        match self {
            CheckOutcome::FactPresent { fact, branch, .. } => {
                format!("fact_present({fact}@{branch})")
            }
            CheckOutcome::GateSatisfied { gate, branch, .. } => {
                format!("gate_satisfied({gate}@{branch})")
            }
            CheckOutcome::BranchCount { expected, .. } => format!("branch_count({expected})"),
        }
    }
}

/// Judge one turn against its expectations.
pub fn judge_turn(turn: usize, scripted: &TurnSpec, result: &StepResult) -> TurnOutcome {
    let decision = result.decision.as_ref();
    let mode = decision.map(|d| d.mode);
    let flow_node = decision.map(|d| d.flow_node.clone());
    let mut mismatches = Vec::new();

    if let Some(expected) = scripted.expect_status
        && expected != result.status
    {
        mismatches.push(format!("status: expected {expected:?}, got {:?}", result.status));
    }
    if let Some(expected) = scripted.expect_mode
        && Some(expected) != mode
    {
        mismatches.push(format!("mode: expected {expected}, got {}", describe(mode)));
    }
    if let Some(expected) = &scripted.expect_node
        && Some(expected) != flow_node.as_ref()
    {
        mismatches.push(format!(
            "node: expected {expected}, got {}",
            flow_node.as_deref().unwrap_or("none")
        ));
    }
    debug!(turn, mismatches = mismatches.len(), "turn judged");

    TurnOutcome {
        turn,
        branch_id: result.branch_id.clone(),
        status: result.status,
        outcome: result.outcome,
        mode,
        flow_node,
        exec_node: result.new_nodes.first().map(|node| node.id.clone()),
        mismatches,
    }
}

fn describe(mode: Option<Mode>) -> String {
    mode.map_or_else(|| "none".to_string(), |mode| mode.to_string())
}

/// Run all checks against the finished run.
///
/// `labels` maps case branch labels to branch ids.
pub fn run_checks(
    checks: &[Check],
    run: &Run,
    labels: &BTreeMap<String, BranchId>,
) -> Result<Vec<CheckOutcome>> {
    let resolve = |label: &Option<String>| -> Result<BranchId> {
        match label {
            None => Ok(ROOT_BRANCH.to_string()),
            Some(label) => labels
                .get(label)
                .cloned()
                .ok_or_else(|| anyhow!("branch label '{label}' was never forked")),
        }
    };

    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let outcome = match check {
            Check::FactPresent { fact, branch } => {
                let branch = resolve(branch)?;
                let state = run
                    .branch_state(&branch)
                    .with_context(|| format!("state of branch {branch}"))?;
                CheckOutcome::FactPresent {
                    fact: fact.clone(),
                    passed: state.has_fact(fact),
                    branch,
                }
            }
            Check::GateSatisfied { gate, branch } => {
                let branch = resolve(branch)?;
                let state = run
                    .branch_state(&branch)
                    .with_context(|| format!("state of branch {branch}"))?;
                CheckOutcome::GateSatisfied {
                    gate: gate.clone(),
                    passed: state.gate_satisfied(gate),
                    branch,
                }
            }
            Check::BranchCount { count } => {
                let actual = run.branches().len();
                CheckOutcome::BranchCount {
                    expected: *count,
                    actual,
                    passed: actual == *count,
                }
            }
        };
        debug!(check = %outcome.label(), passed = outcome.passed(), "check result");
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flowrunner::io::config::ControllerConfig;
    use flowrunner::io::extractor::StaticExtractor;
    use flowrunner::run::{StepRequest, SystemClock};
    use flowrunner::test_support::contact_flow;

    use super::*;

    fn stepped_run(facts: &[&str]) -> (Run, StepResult) {
        let mut run = Run::new("eval", Arc::new(contact_flow()), ControllerConfig::default());
        let extractor = StaticExtractor::new(facts.iter().map(ToString::to_string).collect());
        let result = run
            .step(StepRequest::on(ROOT_BRANCH).message("hi"), &extractor, &SystemClock)
            .expect("step");
        (run, result)
    }

    #[test]
    fn matching_expectations_pass() {
        let (_, result) = stepped_run(&[]);
        let scripted = TurnSpec {
            expect_mode: Some(Mode::Execute),
            expect_node: Some("contact-1".to_string()),
            expect_status: Some(TurnStatus::Advancing),
            ..TurnSpec::default()
        };
        let outcome = judge_turn(1, &scripted, &result);
        assert!(outcome.passed(), "{:?}", outcome.mismatches);
        assert_eq!(outcome.exec_node.as_deref(), Some("n000001"));
    }

    #[test]
    fn mismatches_name_expected_and_actual() {
        let (_, result) = stepped_run(&[]);
        let scripted = TurnSpec {
            expect_mode: Some(Mode::Broaden),
            ..TurnSpec::default()
        };
        let outcome = judge_turn(1, &scripted, &result);
        assert_eq!(outcome.mismatches, vec!["mode: expected BROADEN, got EXECUTE".to_string()]);
    }

    #[test]
    fn checks_read_branch_tip_state() {
        let (run, _) = stepped_run(&["email"]);
        let checks = vec![
            Check::FactPresent {
                fact: "contact_email".to_string(),
                branch: None,
            },
            Check::GateSatisfied {
                gate: "BOOKED".to_string(),
                branch: None,
            },
            Check::BranchCount { count: 1 },
        ];
        let outcomes = run_checks(&checks, &run, &BTreeMap::new()).expect("checks");
        let passed: Vec<bool> = outcomes.iter().map(CheckOutcome::passed).collect();
        assert_eq!(passed, vec![true, false, true]);
        assert_eq!(outcomes[0].label(), "fact_present(contact_email@main)");
    }
}
