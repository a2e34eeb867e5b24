//! Development-time tracing for debugging the orchestrator.
//!
//! Tracing is dev diagnostics via `RUST_LOG`, output to stderr. It is not
//! part of the product output: turn summaries and trace entries live on
//! [`crate::core::state::TaskState`] and are printed by the REPL.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber for development logging.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset. Output: stderr, compact.
///
/// # Example
/// ```bash
/// RUST_LOG=overseer=debug cargo run -- turn "task: ..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
