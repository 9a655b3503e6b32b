//! Persisted run storage (`.flowrunner/run.json`).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::model::FlowModel;
use crate::run::{Run, RunSnapshot};

/// Load a run snapshot and rebuild it against `flow`.
pub fn load_run(path: &Path, flow: Arc<FlowModel>) -> Result<Run> {
    debug!(path = %path.display(), "loading run");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run {}", path.display()))?;
    let snapshot: RunSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse run {}", path.display()))?;
    Run::from_snapshot(snapshot, flow)
}

/// Atomically write a run snapshot to disk (temp file + rename).
pub fn write_run(path: &Path, run: &Run) -> Result<()> {
    debug!(path = %path.display(), run = %run.id(), nodes = run.history().len(), "writing run");
    let mut buf = serde_json::to_string_pretty(&run.snapshot())?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
