//! Process-wide tracing setup shared by every binary and test harness.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize process-wide observability from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    crate::tracing::init(&TracingConfig::from_env());
}

/// Quiet, human-readable output captured by the test harness.
pub fn init_for_tests() {
    crate::tracing::init(&TracingConfig {
        default_filter: "warn".to_string(),
        format: LogFormat::Pretty,
        test_writer: true,
    });
}
