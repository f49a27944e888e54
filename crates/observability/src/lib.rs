//! Tracing and logging setup shared by stock ledger binaries and tests.

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing for test runs (human-readable, captured per test).
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber configuration (filters, formats).
pub mod tracing;
