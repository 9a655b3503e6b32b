//! CLI tests for flowrunner exit codes.
//!
//! Spawns the flowrunner binary in a temp workspace and checks that each
//! outcome maps to its stable exit code.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use flowrunner::exit_codes;
use flowrunner::io::init::FlowrunnerPaths;

const CONTACT_FLOW: &str = r#"{
    "entryNodeIds": ["contact-1"],
    "primaryGoal": { "type": "GATE", "gate": "CONTACT" },
    "gateDefinitions": {
        "CONTACT": { "satisfiedBy": { "metricsAny": ["contact_email", "contact_phone"] } }
    },
    "factAliases": { "email": "contact_email" },
    "nodes": [
        {
            "id": "contact-1",
            "type": "question",
            "title": "Ask for contact",
            "produces": { "facts": ["email"] },
            "config": {
                "retryPolicy": { "maxAttempts": 1, "onExhaust": "HANDOFF" },
                "satisfies": { "gates": ["CONTACT"] }
            }
        }
    ]
}"#;

const DEADLOCK_FLOW: &str = r#"{
    "entryNodeIds": ["once"],
    "primaryGoal": { "type": "STATE", "state": "done" },
    "nodes": [ { "id": "once", "config": { "runPolicy": { "maxExecutions": 1 } } } ]
}"#;

fn flowrunner(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flowrunner"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn flowrunner")
}

fn workspace(flow: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("flow.json"), flow).expect("write flow");
    let out = flowrunner(temp.path(), &["init", "--flow", "flow.json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK), "{out:?}");
    temp
}

fn stdout_json(out: &Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).expect("json stdout")
}

#[test]
fn validate_accepts_good_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("flow.json"), CONTACT_FLOW).expect("write");
    let out = flowrunner(temp.path(), &["validate", "flow.json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
}

#[test]
fn validate_rejects_undefined_gate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bad = CONTACT_FLOW.replace("\"gates\": [\"CONTACT\"]", "\"gates\": [\"MISSING\"]");
    fs::write(temp.path().join("flow.json"), bad).expect("write");
    let out = flowrunner(temp.path(), &["validate", "flow.json"]);
    assert_eq!(out.status.code(), Some(exit_codes::VALIDATION_ERROR));
    assert!(String::from_utf8_lossy(&out.stderr).contains("MISSING"));
}

#[test]
fn step_reports_ok_then_complete() {
    let temp = workspace(CONTACT_FLOW);
    let out = flowrunner(
        temp.path(),
        &["step", "--message", "john@x.com", "--fact", "email"],
    );
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let result = stdout_json(&out);
    assert_eq!(result["outcome"], "OK");
    assert_eq!(result["readiness_delta"]["unlocked"][0], "CONTACT");

    let out = flowrunner(temp.path(), &["step"]);
    assert_eq!(out.status.code(), Some(exit_codes::COMPLETE));
}

#[test]
fn step_reports_handoff() {
    let temp = workspace(CONTACT_FLOW);
    let first = flowrunner(temp.path(), &["step", "--message", "hi"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let second = flowrunner(temp.path(), &["step", "--message", "no"]);
    assert_eq!(second.status.code(), Some(exit_codes::HANDOFF));
    assert_eq!(stdout_json(&second)["decision"]["mode"], "HANDOFF");
}

#[test]
fn step_reports_deadlock() {
    let temp = workspace(DEADLOCK_FLOW);
    assert_eq!(
        flowrunner(temp.path(), &["step"]).status.code(),
        Some(exit_codes::OK)
    );
    assert_eq!(
        flowrunner(temp.path(), &["step"]).status.code(),
        Some(exit_codes::DEADLOCK)
    );
}

#[test]
fn fork_from_agent_turn_is_rejected() {
    let temp = workspace(CONTACT_FLOW);
    let step = flowrunner(temp.path(), &["step"]);
    let node = stdout_json(&step)["new_nodes"][0]["id"]
        .as_str()
        .expect("node id")
        .to_string();

    let out = flowrunner(temp.path(), &["fork", "--from", &node, "--label", "alt"]);
    assert_eq!(out.status.code(), Some(exit_codes::FORK_REJECTED_NOT_USER_TURN));
}

#[test]
fn fork_then_history_follows_new_branch() {
    let temp = workspace(CONTACT_FLOW);
    let step = flowrunner(temp.path(), &["step", "--message", "hi"]);
    let anchor = stdout_json(&step)["new_nodes"][0]["id"]
        .as_str()
        .expect("node id")
        .to_string();

    let fork = flowrunner(temp.path(), &["fork", "--from", &anchor, "--label", "alt"]);
    assert_eq!(fork.status.code(), Some(exit_codes::OK));
    let branch = stdout_json(&fork)["branch_id"]
        .as_str()
        .expect("branch id")
        .to_string();

    let alt = flowrunner(
        temp.path(),
        &["step", "--branch", &branch, "--message", "phone please"],
    );
    let alt_node = stdout_json(&alt)["new_nodes"][0]["id"]
        .as_str()
        .expect("node id")
        .to_string();
    let history = flowrunner(temp.path(), &["history", &alt_node]);
    assert_eq!(history.status.code(), Some(exit_codes::OK));
    let chain = stdout_json(&history);
    let ids: Vec<&str> = chain
        .as_array()
        .expect("array")
        .iter()
        .map(|node| node["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec![anchor.as_str(), alt_node.as_str()]);
}

#[test]
fn orphaned_history_exits_with_orphan_code() {
    let temp = workspace(CONTACT_FLOW);
    flowrunner(temp.path(), &["step", "--message", "hi"]);

    let paths = FlowrunnerPaths::new(temp.path());
    let raw = fs::read_to_string(&paths.run_path).expect("read run");
    let mut run: serde_json::Value = serde_json::from_str(&raw).expect("parse run");
    run["history"][0]["parent_id"] = serde_json::json!("n404404");
    fs::write(&paths.run_path, run.to_string()).expect("write run");

    let out = flowrunner(temp.path(), &["tree"]);
    assert_eq!(out.status.code(), Some(exit_codes::ORPHANED_NODE));
}
