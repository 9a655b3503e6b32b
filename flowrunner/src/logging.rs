//! Development-time tracing for debugging flowrunner.
//!
//! Diagnostics only: output goes to stderr and is filtered by `RUST_LOG`.
//! The product record of a run is its persisted history and the turn log
//! inside each state checkpoint, neither of which depends on log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` so compile warnings and stagnation
/// escalations stay visible.
///
/// # Example
/// ```bash
/// RUST_LOG=flowrunner=debug flowrunner step --message "hi"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
