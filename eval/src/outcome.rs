use serde::{Deserialize, Serialize};

use crate::judge::{CheckOutcome, TurnOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
    Error,
}

/// `Error` when the script could not be played to the end; otherwise
/// `Success` only if every expectation and check held.
pub fn classify_outcome(
    aborted: bool,
    turns: &[TurnOutcome],
    checks: &[CheckOutcome],
) -> Outcome {
    if aborted {
        return Outcome::Error;
    }
    if turns.iter().all(TurnOutcome::passed) && checks.iter().all(CheckOutcome::passed) {
        Outcome::Success
    } else {
        Outcome::Fail
    }
}

#[cfg(test)]
mod tests {
    use flowrunner::core::types::{OutcomeCode, TurnStatus};

    use super::*;

    fn turn(mismatches: &[&str]) -> TurnOutcome {
        TurnOutcome {
            turn: 1,
            branch_id: "main".to_string(),
            status: TurnStatus::Advancing,
            outcome: OutcomeCode::Ok,
            mode: None,
            flow_node: None,
            exec_node: None,
            mismatches: mismatches.iter().map(ToString::to_string).collect(),
        }
    }

    fn check(passed: bool) -> CheckOutcome {
        CheckOutcome::BranchCount {
            expected: 1,
            actual: 1,
            passed,
        }
    }

    #[test]
    fn success_when_everything_holds() {
        assert_eq!(
            classify_outcome(false, &[turn(&[])], &[check(true)]),
            Outcome::Success
        );
    }

    #[test]
    fn fail_on_turn_mismatch() {
        assert_eq!(
            classify_outcome(false, &[turn(&["mode"])], &[check(true)]),
            Outcome::Fail
        );
    }

    #[test]
    fn fail_on_check() {
        assert_eq!(
            classify_outcome(false, &[turn(&[])], &[check(false)]),
            Outcome::Fail
        );
    }

    #[test]
    fn error_when_aborted() {
        assert_eq!(classify_outcome(true, &[], &[]), Outcome::Error);
    }
}
