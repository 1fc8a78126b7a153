//! Diagnostics for operators debugging a run.
//!
//! Tracing output goes to stderr and is never persisted. The run's product
//! artifacts (`events.jsonl`, `summary.json` under `.conductor/runs/`) are
//! written by `io::run_log` regardless of the filter set here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "conductor=info,warn" } else { "warn" }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins over `verbose`, e.g.
/// `RUST_LOG=conductor::decision=debug conductor run "build a calculator"`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(verbose))
        .init();
}
