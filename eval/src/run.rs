//! Case execution orchestration.
//!
//! Plays a case's scripted turns against a fresh in-memory run, judges each
//! turn, runs the final checks, and writes one result file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use flowrunner::core::branches::ROOT_BRANCH;
use flowrunner::core::types::{BranchId, ExecNodeId};
use flowrunner::io::config::ControllerConfig;
use flowrunner::io::extractor::StaticExtractor;
use flowrunner::io::flow_store::load_flow;
use flowrunner::run::{Clock, Run, StepRequest, SystemClock};
use tracing::{debug, info, instrument, warn};

use crate::case::{CaseFile, TurnSpec};
use crate::config::apply_case_config;
use crate::judge::{TurnOutcome, judge_turn, run_checks};
use crate::outcome::{Outcome, classify_outcome};
use crate::results::{EvalResult, result_path, write_result};

/// Result of running a single case.
#[derive(Debug)]
pub struct RunOutcome {
    pub eval_run_id: String,
    pub result_path: PathBuf,
    pub outcome: Outcome,
}

/// Turns played so far; survives an aborted script.
#[derive(Debug, Default)]
struct Script {
    turns: Vec<TurnOutcome>,
    /// Case branch label → run branch id.
    labels: BTreeMap<String, BranchId>,
    /// Node each played turn appended, by turn index.
    appended: Vec<Option<ExecNodeId>>,
}

/// Run a case end-to-end.
///
/// `eval_dir` holds `flows/`; the result lands under `results_dir`.
#[instrument(skip_all, fields(case_id = %case.case.id))]
pub fn run_case(eval_dir: &Path, results_dir: &Path, case: &CaseFile) -> Result<RunOutcome> {
    info!("case run started");

    let flow_path = eval_dir.join("flows").join(&case.case.flow);
    let report = load_flow(&flow_path).context("load case flow")?;
    for warning in &report.warnings {
        warn!(%warning, "flow compiled with warning");
    }
    let config = apply_case_config(ControllerConfig::default(), &case.config)?;
    let flow_version = report.model.version().to_string();

    let started_at = Utc::now();
    let eval_run_id = format!("eval-{}", started_at.format("%Y%m%d_%H%M%S_%3f"));
    let mut run = Run::new(eval_run_id.clone(), Arc::new(report.model), config);

    let mut script = Script::default();
    let error = play(&mut run, &case.turns, &mut script, &SystemClock)
        .err()
        .map(|err| format!("{err:#}"));
    if let Some(error) = &error {
        warn!(%error, turns = script.turns.len(), "script aborted");
    }

    let checks = if error.is_none() {
        run_checks(&case.checks, &run, &script.labels).context("run checks")?
    } else {
        Vec::new()
    };
    let outcome = classify_outcome(error.is_some(), &script.turns, &checks);

    let finished_at = Utc::now();
    let duration_secs = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
    let tree = match run.render_tree() {
        Ok(tree) => Some(tree),
        Err(err) => {
            warn!(error = %err, "history tree could not be rendered");
            None
        }
    };

    let result = EvalResult {
        case_id: case.case.id.clone(),
        eval_run_id: eval_run_id.clone(),
        flow: case.case.flow.display().to_string(),
        flow_version,
        outcome,
        start_time: started_at.to_rfc3339(),
        end_time: finished_at.to_rfc3339(),
        duration_secs,
        turns: script.turns,
        checks,
        tree,
        error,
    };
    let path = result_path(results_dir, &case.case.id, &eval_run_id);
    write_result(&path, &result).context("write result")?;

    info!(outcome = ?outcome, result = %path.display(), "case run complete");
    Ok(RunOutcome {
        eval_run_id,
        result_path: path,
        outcome,
    })
}

fn play(run: &mut Run, turns: &[TurnSpec], script: &mut Script, clock: &dyn Clock) -> Result<()> {
    for (index, scripted) in turns.iter().enumerate() {
        let number = index + 1;
        let branch = target_branch(run, scripted, script)
            .with_context(|| format!("turn {number}: select branch"))?;

        let extractor = StaticExtractor::new(scripted.facts.clone());
        let mut request = StepRequest::on(&branch);
        if let Some(message) = scripted.message.as_deref() {
            request = request.message(message);
        }
        let result = run
            .step(request, &extractor, clock)
            .with_context(|| format!("turn {number}: step on {branch}"))?;
        debug!(turn = number, branch = %branch, status = ?result.status, "turn played");

        script
            .appended
            .push(result.new_nodes.first().map(|node| node.id.clone()));
        script.turns.push(judge_turn(number, scripted, &result));
    }
    Ok(())
}

fn target_branch(run: &mut Run, scripted: &TurnSpec, script: &mut Script) -> Result<BranchId> {
    if let Some(fork) = &scripted.fork {
        let anchor = script
            .appended
            .get(fork.from_turn - 1)
            .cloned()
            .flatten()
            .ok_or_else(|| anyhow!("turn {} appended no node to fork from", fork.from_turn))?;
        let forked = run.fork(&anchor, &fork.label)?;
        script
            .labels
            .insert(fork.label.clone(), forked.branch_id.clone());
        return Ok(forked.branch_id);
    }
    match &scripted.branch {
        Some(label) => script
            .labels
            .get(label)
            .cloned()
            .ok_or_else(|| anyhow!("branch '{label}' was never forked")),
        None => Ok(ROOT_BRANCH.to_string()),
    }
}
