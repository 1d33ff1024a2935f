//! Diagnostic logging to stderr.
//!
//! `RUST_LOG` wins when set; otherwise `patchwright=info`, or `debug` with
//! `--verbose`. Run artifacts (audit log, metrics) are written separately
//! and do not depend on the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "patchwright=debug"
    } else {
        "patchwright=info"
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
