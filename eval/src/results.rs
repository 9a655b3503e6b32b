//! Result persistence.
//!
//! Each case run writes one JSON file under `eval/results/<case>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::judge::{CheckOutcome, TurnOutcome};
use crate::outcome::Outcome;

/// Everything recorded about one eval run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResult {
    pub case_id: String,
    pub eval_run_id: String,
    /// Flow file, relative to `eval/flows/`.
    pub flow: String,
    pub flow_version: String,
    pub outcome: Outcome,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub turns: Vec<TurnOutcome>,
    pub checks: Vec<CheckOutcome>,
    /// Rendered history tree of the finished run.
    pub tree: Option<String>,
    /// Why the script stopped early, if it did.
    pub error: Option<String>,
}

pub fn result_path(base_dir: &Path, case_id: &str, eval_run_id: &str) -> PathBuf {
    base_dir.join(case_id).join(format!("{eval_run_id}.json"))
}

pub fn write_result(path: &Path, result: &EvalResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create results dir {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(result).context("serialize result")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write result {}", path.display()))?;
    debug!(path = %path.display(), "result written");
    Ok(())
}

/// Result files for a case, oldest first (ids sort by time).
pub fn load_result_paths(case_results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !case_results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(case_results_dir)
        .with_context(|| format!("read {}", case_results_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn read_result(path: &Path) -> Result<EvalResult> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
