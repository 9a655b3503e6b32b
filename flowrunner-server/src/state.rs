//! Shared application state for the turn server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use flowrunner::core::model::FlowModel;
use flowrunner::flow::{CompileReport, CompileWarning};
use flowrunner::io::config::ControllerConfig;
use flowrunner::run::Run;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::info;
use uuid::Uuid;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    TurnCommitted {
        run_id: String,
        branch_id: String,
        node_id: String,
    },
    BranchCreated {
        run_id: String,
        branch_id: String,
    },
    /// A new flow version is active for new runs.
    FlowReloaded { version: String },
}

/// The flow new runs start against.
#[derive(Debug, Clone)]
pub struct ActiveFlow {
    pub model: Arc<FlowModel>,
    pub warnings: Vec<CompileWarning>,
}

impl From<CompileReport> for ActiveFlow {
    fn from(report: CompileReport) -> Self {
        Self {
            model: Arc::new(report.model),
            warnings: report.warnings,
        }
    }
}

/// Shared state accessible from all request handlers.
///
/// Each run sits behind its own mutex so turns on one run are strictly
/// sequential while different runs proceed in parallel.
#[derive(Clone)]
pub struct AppState {
    /// Flow file watched for hot reload.
    pub flow_path: PathBuf,
    pub config: Arc<ControllerConfig>,
    flow: Arc<RwLock<ActiveFlow>>,
    runs: Arc<RwLock<HashMap<String, Arc<Mutex<Run>>>>>,
    /// Broadcast sender for change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(flow_path: PathBuf, report: CompileReport, config: ControllerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            flow_path,
            config: Arc::new(config),
            flow: Arc::new(RwLock::new(ActiveFlow::from(report))),
            runs: Arc::new(RwLock::new(HashMap::new())),
            event_tx: Arc::new(event_tx),
        }
    }

    pub async fn active_flow(&self) -> ActiveFlow {
        self.flow.read().await.clone()
    }

    /// Swap the flow for new runs; existing runs keep theirs.
    ///
    /// Returns false when the version is unchanged.
    pub async fn replace_flow(&self, report: CompileReport) -> bool {
        let mut flow = self.flow.write().await;
        if flow.model.version() == report.model.version() {
            return false;
        }
        *flow = ActiveFlow::from(report);
        let version = flow.model.version().to_string();
        drop(flow);
        info!(version = %version, "flow reloaded");
        let _ = self.event_tx.send(ChangeEvent::FlowReloaded { version });
        true
    }

    /// Start a run on the active flow and return its id.
    pub async fn create_run(&self) -> String {
        let flow = Arc::clone(&self.flow.read().await.model);
        let run_id = Uuid::new_v4().to_string();
        let run = Run::new(run_id.clone(), flow, (*self.config).clone());
        self.runs
            .write()
            .await
            .insert(run_id.clone(), Arc::new(Mutex::new(run)));
        info!(run = %run_id, "run created");
        run_id
    }

    pub async fn run(&self, run_id: &str) -> Option<Arc<Mutex<Run>>> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a run. Returns false if it did not exist.
    pub async fn abandon_run(&self, run_id: &str) -> bool {
        let removed = self.runs.write().await.remove(run_id).is_some();
        if removed {
            info!(run = %run_id, "run abandoned");
        }
        removed
    }
}
