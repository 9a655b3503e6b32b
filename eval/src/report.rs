use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::outcome::Outcome;
use crate::results::{EvalResult, load_result_paths, read_result};

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub runs: usize,
    pub success: usize,
    pub fail: usize,
    pub error: usize,
    pub avg_duration_secs: Option<f64>,
    /// Turns whose expectations held, over turns played.
    pub turn_pass_rate: (usize, usize),
    pub check_pass_rates: BTreeMap<String, (usize, usize)>,
}

pub fn aggregate(case_results_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();

    for path in load_result_paths(case_results_dir)? {
        let result = match read_result(&path) {
            Ok(result) => result,
            Err(err) => {
                warnings.push(format!("skip {}: {err:#}", path.display()));
                continue;
            }
        };
        add_result(&mut summary, &result);
    }

    Ok((summary, warnings))
}

fn add_result(summary: &mut ReportSummary, result: &EvalResult) {
    summary.runs += 1;
    match result.outcome {
        Outcome::Success => summary.success += 1,
        Outcome::Fail => summary.fail += 1,
        Outcome::Error => summary.error += 1,
    }

    summary.avg_duration_secs = Some(match summary.avg_duration_secs {
        None => result.duration_secs,
        Some(avg) => {
            let total = avg * (summary.runs as f64 - 1.0) + result.duration_secs;
            total / summary.runs as f64
        }
    });

    for turn in &result.turns {
        if turn.passed() {
            summary.turn_pass_rate.0 += 1;
        }
        summary.turn_pass_rate.1 += 1;
    }

    for check in &result.checks {
        let entry = summary.check_pass_rates.entry(check.label()).or_insert((0, 0));
        if check.passed() {
            entry.0 += 1;
        }
        entry.1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::judge::CheckOutcome;
    use crate::results::{result_path, write_result};

    fn result(id: &str, outcome: Outcome, duration: f64, check_passed: bool) -> EvalResult {
        EvalResult {
            case_id: "case".to_string(),
            eval_run_id: id.to_string(),
            flow: "contact.json".to_string(),
            flow_version: "v".to_string(),
            outcome,
            start_time: "now".to_string(),
            end_time: "later".to_string(),
            duration_secs: duration,
            turns: Vec::new(),
            checks: vec![CheckOutcome::BranchCount {
                expected: 2,
                actual: if check_passed { 2 } else { 1 },
                passed: check_passed,
            }],
            tree: None,
            error: None,
        }
    }

    #[test]
    fn aggregates_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        for r in [
            result("eval-1", Outcome::Success, 5.0, true),
            result("eval-2", Outcome::Fail, 15.0, false),
        ] {
            write_result(&result_path(temp.path(), "case", &r.eval_run_id), &r).expect("write");
        }
        fs::write(temp.path().join("case").join("broken.json"), "{").expect("broken");

        let (summary, warnings) = aggregate(&temp.path().join("case")).expect("aggregate");
        assert_eq!(warnings.len(), 1);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.avg_duration_secs, Some(10.0));
        assert_eq!(
            summary.check_pass_rates.get("branch_count(2)"),
            Some(&(1, 2))
        );
    }
}
