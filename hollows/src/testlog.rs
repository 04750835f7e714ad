//! Logging setup for tests.

/// Install a logger so tests that want log output can see it.
pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}
