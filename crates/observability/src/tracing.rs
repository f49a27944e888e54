//! Subscriber initialization.
//!
//! Both entry points read `RUST_LOG` and fall back to a default directive
//! when it is unset or invalid.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";
const TEST_DIRECTIVE: &str = "debug";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps, configurable via `RUST_LOG`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_DIRECTIVE))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact output routed through the test harness so it only shows for
/// failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(TEST_DIRECTIVE))
        .with_test_writer()
        .compact()
        .try_init();
}
