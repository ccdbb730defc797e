//! Shared helpers for integration tests.
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging once per binary. `RUST_LOG=debug` makes the
/// engine's internal state transitions visible in test output.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
