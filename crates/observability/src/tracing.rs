//! Tracing/logging initialization.
//!
//! Workers log with structured fields (group, stream, entry, message id);
//! JSON output keeps those fields machine-readable when many worker
//! processes interleave on one collector.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process.
///
/// Filtering comes from `RUST_LOG`, defaulting to `info`. Safe to call
/// multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(false)
        .try_init();
}
