//! Logging initialization.
//!
//! The `FM_DEBUG` 0–5 verbosity knob maps onto tracing level filters;
//! an explicit `RUST_LOG` wins over it.

use tracing_subscriber::EnvFilter;

/// The filter directive for a verbosity level.
#[must_use]
pub fn filter_for_level(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Initialize the global subscriber. Safe to call more than once; only
/// the first call wins.
pub fn init(debug_level: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_level(debug_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
