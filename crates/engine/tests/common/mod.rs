//! Shared helpers for runtime integration tests

use rewind_engine::{Runtime, RuntimeConfig, Speculative};
use std::sync::Once;
use tracing::Level;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
///
/// `LOG_LEVEL` overrides the default `INFO` level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|level| level.parse::<Level>().ok())
            .unwrap_or(Level::INFO);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .try_init();
    });
}

/// A speculative runtime with default configuration
#[allow(dead_code)]
pub fn runtime() -> Speculative {
    init_tracing();
    Speculative::new(RuntimeConfig::default())
}

/// Assert the calling thread's nest is idle and consistent
#[allow(dead_code)]
pub fn assert_idle(rt: &dyn Runtime) {
    assert!(!rt.is_transactional());
    assert!(!rt.is_committing_or_aborting());
    rt.consistency_check().unwrap();
}
