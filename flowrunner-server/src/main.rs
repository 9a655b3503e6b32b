//! Flowrunner server - HTTP turn API over in-memory runs.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use flowrunner::io::config::{ControllerConfig, load_config};
use flowrunner::io::flow_store::load_flow;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "flowrunner-server")]
#[command(about = "HTTP turn API for conversation flow runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Flow definition (watched for edits)
    #[arg(long)]
    flow: PathBuf,

    /// Controller config (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowrunner_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let flow_path = args
        .flow
        .canonicalize()
        .with_context(|| format!("resolve flow path {}", args.flow.display()))?;
    let report = load_flow(&flow_path)?;
    for warning in &report.warnings {
        warn!(%warning, "flow compiled with warning");
    }
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ControllerConfig::default(),
    };
    info!(
        flow = %flow_path.display(),
        version = %report.model.version(),
        "starting flowrunner-server"
    );

    let state = AppState::new(flow_path, report, config);
    sse::start_flow_watcher(state.clone());

    let app = routes::app(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
