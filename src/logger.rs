//! Logging setup for the binary and integration tests.
//!
//! Default level is INFO, overridable through `RUST_LOG`:
//! ```bash
//! RUST_LOG=dense_vslam=debug cargo run -- config.json
//! ```

use tracing::Level;

pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the global subscriber. Later calls are no-ops, so tests may call
/// this freely.
pub fn init_logger_with_level(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .with_level(true)
        // Workers are named threads.
        .with_thread_names(true)
        .try_init();
}
