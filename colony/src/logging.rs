//! Development-time tracing for debugging runs.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG` (or `--verbose`).
//! Product artifacts (the audit journal and metrics files) are written
//! unconditionally and are not tracing output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` raises the default from
/// `warn` to debug for this crate.
pub fn init(verbose: bool) {
    let default_filter = if verbose { "warn,colony=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
