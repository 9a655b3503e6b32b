//! Conversation flow runner CLI.
//!
//! Keeps a flow, controller config, and one run in `.flowrunner/`. Each
//! `step` advances a branch by one turn; `fork` starts an alternate branch
//! at an earlier user reply.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use flowrunner::core::branches::ROOT_BRANCH;
use flowrunner::error::outcome_for_error;
use flowrunner::exit_codes;
use flowrunner::io::flow_store::load_flow;
use flowrunner::io::init::{InitOptions, init_workspace};
use flowrunner::logging;
use flowrunner::run::SystemClock;
use flowrunner::workspace::{StepArgs, Workspace};

#[derive(Parser)]
#[command(
    name = "flowrunner",
    version,
    about = "Deterministic conversation flow controller"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a flow definition and report warnings.
    Validate {
        /// Path to the flow JSON.
        flow: PathBuf,
    },
    /// Create `.flowrunner/` with a copy of the flow and a fresh run.
    Init {
        /// Flow definition to install.
        #[arg(long)]
        flow: PathBuf,
        /// Overwrite an existing `.flowrunner/`.
        #[arg(short, long)]
        force: bool,
    },
    /// Advance a branch by one turn and print the result as JSON.
    Step {
        #[arg(long, default_value = ROOT_BRANCH)]
        branch: String,
        /// Expected branch leaf; rejected if the branch moved on.
        #[arg(long)]
        cursor: Option<String>,
        /// The user's reply for this turn.
        #[arg(long)]
        message: Option<String>,
        /// Fact extracted from the reply (raw or canonical name). Repeatable.
        #[arg(long = "fact")]
        facts: Vec<String>,
    },
    /// Start a new branch at a node that carries a user message.
    Fork {
        #[arg(long)]
        from: String,
        #[arg(long)]
        label: String,
    },
    /// Print the execution history as a tree.
    Tree {
        /// Emit the forest as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the conversation path from the root to a node.
    History {
        /// Execution node id.
        id: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(outcome_for_error(&err).exit_code());
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = Path::new(".");
    match cli.command {
        Command::Validate { flow } => cmd_validate(&flow),
        Command::Init { flow, force } => cmd_init(root, flow, force),
        Command::Step {
            branch,
            cursor,
            message,
            facts,
        } => cmd_step(
            root,
            &StepArgs {
                branch,
                cursor,
                message,
                facts,
            },
        ),
        Command::Fork { from, label } => cmd_fork(root, &from, &label),
        Command::Tree { json } => cmd_tree(root, json),
        Command::History { id } => cmd_history(root, &id),
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let report = load_flow(path)?;
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "{}: ok ({} nodes, version {})",
        path.display(),
        report.model.nodes().len(),
        report.model.version()
    );
    Ok(exit_codes::OK)
}

fn cmd_init(root: &Path, flow: PathBuf, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { flow, force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_step(root: &Path, args: &StepArgs) -> Result<i32> {
    let mut workspace = Workspace::open(root)?;
    let result = workspace.step(args, &SystemClock)?;
    print_json(&result)?;
    Ok(result.outcome.exit_code())
}

fn cmd_fork(root: &Path, from: &str, label: &str) -> Result<i32> {
    let mut workspace = Workspace::open(root)?;
    let fork = workspace.fork(from, label)?;
    print_json(&fork)?;
    Ok(exit_codes::OK)
}

fn cmd_tree(root: &Path, json: bool) -> Result<i32> {
    let workspace = Workspace::open(root)?;
    if json {
        print_json(&workspace.run().tree()?)?;
    } else {
        print!("{}", workspace.run().render_tree()?);
    }
    Ok(exit_codes::OK)
}

fn cmd_history(root: &Path, id: &str) -> Result<i32> {
    let workspace = Workspace::open(root)?;
    print_json(&workspace.history(id)?)?;
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["flowrunner", "init", "--flow", "f.json", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn step_defaults_to_main_branch() {
        let cli = Cli::parse_from(["flowrunner", "step", "--message", "hi"]);
        let Command::Step {
            branch,
            cursor,
            message,
            facts,
        } = cli.command
        else {
            panic!("expected step");
        };
        assert_eq!(branch, ROOT_BRANCH);
        assert_eq!(cursor, None);
        assert_eq!(message.as_deref(), Some("hi"));
        assert!(facts.is_empty());
    }

    #[test]
    fn step_collects_repeated_facts() {
        let cli = Cli::parse_from([
            "flowrunner",
            "step",
            "--fact",
            "email",
            "--fact",
            "phone",
        ]);
        let Command::Step { facts, .. } = cli.command else {
            panic!("expected step");
        };
        assert_eq!(facts, vec!["email".to_string(), "phone".to_string()]);
    }

    #[test]
    fn fork_requires_label() {
        assert!(Cli::try_parse_from(["flowrunner", "fork", "--from", "n000001"]).is_err());
    }
}
