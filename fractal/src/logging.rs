//! Diagnostic tracing for the orchestrator.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from the
//! durable run record: task state and attempt history live in the store, and
//! worker output lives in per-attempt log files.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "fractal=info";

/// Initialize the global subscriber. Call once, from `main`.
///
/// # Example
/// ```bash
/// RUST_LOG=fractal=debug fractal run --spec SPEC.md
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
