//! Logging setup.
//!
//! Level selection, highest precedence first:
//! - `CADENCE_LOG` as an `EnvFilter` directive (e.g. `cadence=trace`)
//! - `--debug` flag or `CADENCE_DEBUG=1` for `debug`
//! - `info` otherwise
//!
//! Output goes to stderr; stdout is left for command output.

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CADENCE_LOG";
pub const DEBUG_ENV: &str = "CADENCE_DEBUG";

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the filter for the given debug flag.
pub fn filter(debug: bool) -> EnvFilter {
    let fallback = if debug || env_debug() { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(debug: bool) {
    let _ = fmt()
        .with_env_filter(filter(debug))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Subscriber for tests: captured per test, printed only on failure.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(filter(false))
        .with_test_writer()
        .try_init();
}
