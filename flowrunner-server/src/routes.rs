//! HTTP route handlers for the turn API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use flowrunner::core::branches::ROOT_BRANCH;
use flowrunner::core::history::ExecutionNode;
use flowrunner::core::types::OutcomeCode;
use flowrunner::error::outcome_for_error;
use flowrunner::flow::CompileWarning;
use flowrunner::io::extractor::StaticExtractor;
use flowrunner::run::{ForkResult, StepRequest, StepResult, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::sse;
use crate::state::{AppState, ChangeEvent};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Full application: `/api` routes, the SSE feed, and CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/flow", get(get_flow))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{run_id}", delete(abandon_run))
        .route("/runs/{run_id}/step", post(step))
        .route("/runs/{run_id}/fork", post(fork))
        .route("/runs/{run_id}/tree", get(get_tree))
        .route("/runs/{run_id}/ancestry/{node_id}", get(get_ancestry))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct FlowInfo {
    version: String,
    entry_node_ids: Vec<String>,
    node_count: usize,
    warnings: Vec<CompileWarning>,
}

/// GET /api/flow - the flow new runs start against.
async fn get_flow(State(state): State<AppState>) -> Json<FlowInfo> {
    let flow = state.active_flow().await;
    Json(FlowInfo {
        version: flow.model.version().to_string(),
        entry_node_ids: flow.model.entry_node_ids().to_vec(),
        node_count: flow.model.nodes().len(),
        warnings: flow.warnings,
    })
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<String>,
}

async fn list_runs(State(state): State<AppState>) -> Json<RunsResponse> {
    Json(RunsResponse {
        runs: state.run_ids().await,
    })
}

#[derive(Serialize)]
struct CreatedRun {
    run_id: String,
    flow_version: String,
}

/// POST /api/runs - start a run on the active flow.
async fn create_run(State(state): State<AppState>) -> (StatusCode, Json<CreatedRun>) {
    let run_id = state.create_run().await;
    let flow_version = state.active_flow().await.model.version().to_string();
    (
        StatusCode::CREATED,
        Json(CreatedRun {
            run_id,
            flow_version,
        }),
    )
}

/// DELETE /api/runs/:run - abandon a run.
async fn abandon_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.abandon_run(&run_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(unknown_run(&run_id))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StepBody {
    branch: Option<String>,
    cursor: Option<String>,
    message: Option<String>,
    /// Facts already extracted from `message` by the caller.
    facts: Vec<String>,
}

/// POST /api/runs/:run/step - one controller turn.
///
/// The run's mutex is held for the whole turn.
async fn step(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<StepBody>,
) -> ApiResult<StepResult> {
    let run = state.run(&run_id).await.ok_or_else(|| unknown_run(&run_id))?;
    let mut run = run.lock().await;
    let branch = body.branch.as_deref().unwrap_or(ROOT_BRANCH);
    let mut request = StepRequest::on(branch);
    if let Some(cursor) = body.cursor.as_deref() {
        request = request.cursor(cursor);
    }
    if let Some(message) = body.message.as_deref() {
        request = request.message(message);
    }
    let extractor = StaticExtractor::new(body.facts);
    let result = run
        .step(request, &extractor, &SystemClock)
        .map_err(|err| api_error(&err))?;
    drop(run);

    debug!(run = %run_id, status = ?result.status, "step handled");
    for node in &result.new_nodes {
        let _ = state.event_tx.send(ChangeEvent::TurnCommitted {
            run_id: run_id.clone(),
            branch_id: node.branch_id.clone(),
            node_id: node.id.clone(),
        });
    }
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct ForkBody {
    from: String,
    label: String,
}

/// POST /api/runs/:run/fork - branch at a user-message node.
async fn fork(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<ForkBody>,
) -> ApiResult<ForkResult> {
    let run = state.run(&run_id).await.ok_or_else(|| unknown_run(&run_id))?;
    let result = run
        .lock()
        .await
        .fork(&body.from, &body.label)
        .map_err(|err| api_error(&err.into()))?;
    let _ = state.event_tx.send(ChangeEvent::BranchCreated {
        run_id,
        branch_id: result.branch_id.clone(),
    });
    Ok(Json(result))
}

/// GET /api/runs/:run/tree - divergence-aware forest.
async fn get_tree(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<Value> {
    let run = state.run(&run_id).await.ok_or_else(|| unknown_run(&run_id))?;
    let run = run.lock().await;
    let forest = run.tree().map_err(|err| api_error(&err.into()))?;
    let value = serde_json::to_value(&forest).map_err(|err| api_error(&err.into()))?;
    Ok(Json(value))
}

/// GET /api/runs/:run/ancestry/:node - conversation path from the root.
async fn get_ancestry(
    State(state): State<AppState>,
    Path((run_id, node_id)): Path<(String, String)>,
) -> ApiResult<Vec<ExecutionNode>> {
    let run = state.run(&run_id).await.ok_or_else(|| unknown_run(&run_id))?;
    let run = run.lock().await;
    let chain = run
        .ancestry(&node_id)
        .map_err(|err| api_error(&err.into()))?;
    Ok(Json(chain.into_iter().cloned().collect()))
}

fn unknown_run(run_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("run {run_id} not found") })),
    )
}

/// Map an error chain to a status code and `{error, outcome}` body.
fn api_error(err: &anyhow::Error) -> ApiError {
    let outcome = outcome_for_error(err);
    let status = match outcome {
        OutcomeCode::ForkRejectedNotUserTurn => StatusCode::CONFLICT,
        OutcomeCode::OrphanedNode => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(json!({ "error": format!("{err:#}"), "outcome": outcome })),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use flowrunner::io::config::ControllerConfig;
    use flowrunner::io::flow_store::parse_flow;
    use tower::ServiceExt;

    use super::*;

    const FLOW: &str = r#"{
        "entryNodeIds": ["contact-1"],
        "primaryGoal": { "type": "GATE", "gate": "CONTACT" },
        "gateDefinitions": {
            "CONTACT": { "satisfiedBy": { "metricsAny": ["contact_email"] } }
        },
        "factAliases": { "email": "contact_email" },
        "nodes": [
            {
                "id": "contact-1",
                "produces": { "facts": ["email"] },
                "config": {
                    "retryPolicy": { "maxAttempts": 2, "onExhaust": "BROADEN" },
                    "satisfies": { "gates": ["CONTACT"] }
                }
            }
        ]
    }"#;

    fn test_state() -> AppState {
        let report = parse_flow(FLOW, "test").expect("flow");
        AppState::new(PathBuf::from("flow.json"), report, ControllerConfig::default())
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    async fn new_run(app: &Router) -> String {
        let (status, body) = call(app, "POST", "/api/runs", None).await;
        assert_eq!(status, StatusCode::CREATED);
        body["run_id"].as_str().expect("run id").to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(test_state());
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".to_string()));
    }

    #[tokio::test]
    async fn step_unlocks_gate_from_supplied_facts() {
        let state = test_state();
        let mut events = state.event_tx.subscribe();
        let app = app(state);
        let run_id = new_run(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/runs/{run_id}/step"),
            Some(json!({ "message": "john@x.com", "facts": ["email"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "OK");
        assert_eq!(body["readiness_delta"]["unlocked"], json!(["CONTACT"]));

        let event = events.try_recv().expect("turn event");
        assert!(matches!(event, ChangeEvent::TurnCommitted { run_id: id, .. } if id == run_id));

        let (_, done) = call(&app, "POST", &format!("/api/runs/{run_id}/step"), Some(json!({}))).await;
        assert_eq!(done["status"], "COMPLETE");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = app(test_state());
        let (status, _) = call(&app, "POST", "/api/runs/nope/step", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "DELETE", "/api/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fork_from_agent_turn_conflicts() {
        let app = app(test_state());
        let run_id = new_run(&app).await;
        let (_, step) = call(&app, "POST", &format!("/api/runs/{run_id}/step"), Some(json!({}))).await;
        let node = step["new_nodes"][0]["id"].as_str().expect("node").to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/runs/{run_id}/fork"),
            Some(json!({ "from": node, "label": "alt" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["outcome"], "FORK_REJECTED_NOT_USER_TURN");
    }

    #[tokio::test]
    async fn stale_cursor_is_unprocessable() {
        let app = app(test_state());
        let run_id = new_run(&app).await;
        let uri = format!("/api/runs/{run_id}/step");
        let (_, first) = call(&app, "POST", &uri, Some(json!({ "message": "hi" }))).await;
        call(&app, "POST", &uri, Some(json!({ "message": "again" }))).await;
        let cursor = first["new_nodes"][0]["id"].clone();

        let (status, body) = call(&app, "POST", &uri, Some(json!({ "cursor": cursor }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["outcome"], "VALIDATION_ERROR");
    }

    /// Concurrent steps on one run serialize into a single chain.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_steps_never_interleave() {
        let app = app(test_state());
        let run_id = new_run(&app).await;
        let uri = format!("/api/runs/{run_id}/step");

        let mut handles = Vec::new();
        for i in 0..6 {
            let app = app.clone();
            let uri = uri.clone();
            handles.push(tokio::spawn(async move {
                call(&app, "POST", &uri, Some(json!({ "message": format!("reply {i}") }))).await
            }));
        }
        for handle in handles {
            let (status, _) = handle.await.expect("join");
            assert_eq!(status, StatusCode::OK);
        }

        let (status, chain) = call(
            &app,
            "GET",
            &format!("/api/runs/{run_id}/ancestry/n000006"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let turns: Vec<u64> = chain
            .as_array()
            .expect("chain")
            .iter()
            .map(|node| node["turn_number"].as_u64().expect("turn"))
            .collect();
        assert_eq!(turns, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn runs_are_independent() {
        let app = app(test_state());
        let a = new_run(&app).await;
        let b = new_run(&app).await;
        call(
            &app,
            "POST",
            &format!("/api/runs/{a}/step"),
            Some(json!({ "message": "x", "facts": ["email"] })),
        )
        .await;
        let (_, b_step) = call(&app, "POST", &format!("/api/runs/{b}/step"), Some(json!({}))).await;
        assert_eq!(b_step["readiness_delta"]["unlocked"], json!([]));

        let (_, runs) = call(&app, "GET", "/api/runs", None).await;
        assert_eq!(runs["runs"].as_array().expect("runs").len(), 2);
    }
}
