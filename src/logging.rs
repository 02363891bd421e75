//! Tracing setup for host programs.
//!
//! The crate itself only emits `tracing` events; embedding programs that
//! want them on stderr can call [`init`] once at startup instead of wiring
//! up their own subscriber.

use tracing_subscriber::EnvFilter;

/// Install a global subscriber filtered by `RUST_LOG`, defaulting to `info`
/// for this crate. Calling it twice is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,burble=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
