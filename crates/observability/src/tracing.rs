//! Tracing/logging initialization.
//!
//! Workers log JSON lines; the filter comes from `RUST_LOG` and defaults to
//! `info`. Tests use a compact, human-readable format captured by the test
//! harness.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize JSON logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Like [`init`], with `default` used when `RUST_LOG` is unset or invalid.
pub fn init_with_default(default: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact logging routed through the test harness' output capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .compact()
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init_for_tests();
        init();
        init_with_default("warn");
        ::tracing::info!(component = "observability", "still logging after repeated init");
    }
}
