//! Leveled logging setup. The original C logger took a single level and
//! wrote DEBUG/INFO/WARN/ERROR/FATAL lines to stderr; here that's an
//! `EnvFilter` default plus `tracing-subscriber`'s fmt layer, so the level
//! is still one knob (`RUST_LOG`, defaulting to `info`).
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once at process startup, before
/// anything else logs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
