//! Tracing setup for binaries and integration tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the fmt subscriber, filtered by `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
