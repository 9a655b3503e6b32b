//! Initialization helpers for `.flowrunner/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use super::config::{ControllerConfig, write_config};
use super::flow_store::parse_flow;
use super::run_store::write_run;
use crate::run::Run;

/// All canonical paths within `.flowrunner/` for a project root.
#[derive(Debug, Clone)]
pub struct FlowrunnerPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub flow_path: PathBuf,
    pub config_path: PathBuf,
    pub run_path: PathBuf,
}

impl FlowrunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".flowrunner");
        Self {
            root,
            gitignore_path: state_dir.join(".gitignore"),
            flow_path: state_dir.join("flow.json"),
            config_path: state_dir.join("config.toml"),
            run_path: state_dir.join("run.json"),
            state_dir,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Flow definition to copy into the workspace.
    pub flow: PathBuf,
    /// If true, overwrite an existing `.flowrunner/`.
    pub force: bool,
}

/// Create `.flowrunner/` in `root` with a copy of the flow, default config,
/// and an empty run.
///
/// The flow must compile; nothing is written otherwise.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<FlowrunnerPaths> {
    let paths = FlowrunnerPaths::new(root);
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "flowrunner init: .flowrunner already exists (use --force to overwrite)"
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "flowrunner init: .flowrunner exists but is not a directory"
        ));
    }

    let contents = fs::read_to_string(&options.flow)
        .with_context(|| format!("read flow {}", options.flow.display()))?;
    let report = parse_flow(&contents, &options.flow.display().to_string())?;

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    write_file(&paths.gitignore_path, GITIGNORE)?;
    write_file(&paths.flow_path, &contents)?;
    let config = ControllerConfig::default();
    write_config(&paths.config_path, &config)?;
    let run_id = format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S"));
    let run = Run::new(run_id, Arc::new(report.model), config);
    write_run(&paths.run_path, &run)?;

    info!(root = %root.display(), run = %run.id(), "workspace initialized");
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

const GITIGNORE: &str = "run.json\n";
