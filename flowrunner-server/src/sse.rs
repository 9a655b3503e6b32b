//! Server-Sent Events stream and flow file watcher.

use std::convert::Infallible;
use std::fs;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use flowrunner::io::flow_store::parse_flow;
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Debug, Serialize, PartialEq, Eq)]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl From<&ChangeEvent> for SsePayload {
    fn from(event: &ChangeEvent) -> Self {
        let empty = SsePayload {
            event_type: "",
            run_id: None,
            branch_id: None,
            node_id: None,
            version: None,
        };
        match event {
            ChangeEvent::TurnCommitted {
                run_id,
                branch_id,
                node_id,
            } => SsePayload {
                event_type: "turn_committed",
                run_id: Some(run_id.clone()),
                branch_id: Some(branch_id.clone()),
                node_id: Some(node_id.clone()),
                ..empty
            },
            ChangeEvent::BranchCreated { run_id, branch_id } => SsePayload {
                event_type: "branch_created",
                run_id: Some(run_id.clone()),
                branch_id: Some(branch_id.clone()),
                ..empty
            },
            ChangeEvent::FlowReloaded { version } => SsePayload {
                event_type: "flow_reloaded",
                version: Some(version.clone()),
                ..empty
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the flow file watcher in a background task.
pub fn start_flow_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_flow_watcher(state).await {
            warn!(error = %e, "flow watcher failed");
        }
    });
}

async fn run_flow_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;
    watcher.watch(&state.flow_path, RecursiveMode::NonRecursive)?;
    info!(path = %state.flow_path.display(), "watching flow file");

    // Editors often write in several steps; reload once per quiet tick.
    let mut pending = false;
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    pending = true;
                }
            }
            _ = flush_tick.tick() => {
                if pending {
                    pending = false;
                    reload_flow(&state).await;
                }
            }
        }
    }
}

/// Recompile the flow file and activate it for new runs.
///
/// An invalid edit is logged and the previous flow stays active.
pub async fn reload_flow(state: &AppState) -> bool {
    let origin = state.flow_path.display().to_string();
    let contents = match fs::read_to_string(&state.flow_path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %origin, error = %err, "flow file unreadable; keeping current flow");
            return false;
        }
    };
    match parse_flow(&contents, &origin) {
        Ok(report) => {
            for warning in &report.warnings {
                warn!(%warning, "reloaded flow compiled with warning");
            }
            state.replace_flow(report).await
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(path = %origin, error = %message, "flow edit rejected; keeping current flow");
            debug!("existing runs are unaffected");
            false
        }
    }
}
