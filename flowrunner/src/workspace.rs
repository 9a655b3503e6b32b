//! File-backed orchestration for CLI commands over `.flowrunner/`.
//!
//! Each command loads the flow, config, and run from disk, applies one
//! operation through [`Run`], and writes the run back only when it changed.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::history::ExecutionNode;
use crate::core::types::FactName;
use crate::flow::CompileWarning;
use crate::io::config::load_config;
use crate::io::extractor::StaticExtractor;
use crate::io::flow_store::load_flow;
use crate::io::init::FlowrunnerPaths;
use crate::io::run_store::{load_run, write_run};
use crate::run::{Clock, ForkResult, Run, StepRequest, StepResult};

/// An opened `.flowrunner/` directory.
#[derive(Debug)]
pub struct Workspace {
    paths: FlowrunnerPaths,
    run: Run,
    warnings: Vec<CompileWarning>,
}

/// Arguments for [`Workspace::step`].
#[derive(Debug, Clone, Default)]
pub struct StepArgs {
    pub branch: String,
    pub cursor: Option<String>,
    pub message: Option<String>,
    pub facts: Vec<FactName>,
}

impl Workspace {
    /// Load flow, config, and run from `root/.flowrunner`.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = FlowrunnerPaths::new(root);
        if !paths.state_dir.is_dir() {
            return Err(anyhow!(
                "no .flowrunner directory in {} (run `flowrunner init` first)",
                root.display()
            ));
        }
        let report = load_flow(&paths.flow_path)?;
        let config = load_config(&paths.config_path)?;
        let mut run = load_run(&paths.run_path, Arc::new(report.model))?;
        run.set_config(config);
        debug!(run = %run.id(), nodes = run.history().len(), "workspace opened");
        Ok(Self {
            paths,
            run,
            warnings: report.warnings,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Run one turn with caller-supplied facts and persist it if committed.
    pub fn step(&mut self, args: &StepArgs, clock: &dyn Clock) -> Result<StepResult> {
        let extractor = StaticExtractor::new(args.facts.clone());
        let mut request = StepRequest::on(&args.branch);
        if let Some(cursor) = args.cursor.as_deref() {
            request = request.cursor(cursor);
        }
        if let Some(message) = args.message.as_deref() {
            request = request.message(message);
        }
        let result = self.run.step(request, &extractor, clock)?;
        if !result.new_nodes.is_empty() {
            self.save()?;
        }
        Ok(result)
    }

    /// Fork a branch and persist it.
    pub fn fork(&mut self, from: &str, label: &str) -> Result<ForkResult> {
        let fork = self.run.fork(from, label)?;
        self.save()?;
        Ok(fork)
    }

    /// Ancestry chain of `node`, owned for printing.
    pub fn history(&self, node: &str) -> Result<Vec<ExecutionNode>> {
        let chain = self.run.ancestry(node)?;
        Ok(chain.into_iter().cloned().collect())
    }

    fn save(&self) -> Result<()> {
        write_run(&self.paths.run_path, &self.run)
            .with_context(|| format!("save run {}", self.run.id()))
    }
}
