//! Diagnostic tracing for the taskloop binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr
//!   so stdout carries only the command's JSON result.
//!
//! - **Run artifacts (`io/run_log`)**: `agent.log` and `meta.json` under
//!   `.taskloop/workflows/<name>/runs/<run-id>/`. Always written, unaffected
//!   by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`, so store recoveries (backup
/// restore, long-held locks, registry purge) are visible by default.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run --mode batch
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
