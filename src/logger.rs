//! Logging setup for the demo binary and downstream tools.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the executable. Default level is INFO, overridable with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=covins_optim=debug covins-optim-demo
//! ```

use tracing::Level;

/// Installs the standard fmt subscriber at INFO.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Installs the fmt subscriber with `default_level` unless `RUST_LOG` says
/// otherwise. Calling it twice is harmless: the second install is ignored.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .try_init();

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
