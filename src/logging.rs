#![forbid(unsafe_code)]

//! Diagnostics on stderr via `tracing`.
//!
//! Step output and agent transcripts are task artifacts and are written
//! regardless of the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Install the global subscriber. `RUST_LOG` wins; otherwise `warn`, or
/// `info` with `verbose`. Safe to call more than once.
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
