//! Process-wide logging setup shared by workers and tests.

/// Initialize JSON tracing for the process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, formatters).
pub mod tracing;
