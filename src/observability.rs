//! Logging initialization for the binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! job of `main`.

use tracing_subscriber::EnvFilter;

/// Install the process-wide JSON subscriber.
///
/// The filter comes from `RUST_LOG`, then `LOG_LEVEL`, then `info`. Output
/// goes to stderr so stdout stays free for command results. Calling this more
/// than once is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(|_| ())
                .and_then(|level| EnvFilter::try_new(level.to_lowercase()).map_err(|_| ()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
