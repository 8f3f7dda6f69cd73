//! Process-wide `tracing` setup, following the `EnvFilter::try_from_default_env`
//! fallback chain this codebase uses at its binary entry points.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber writing to stderr. Safe to call
/// more than once; only the first call takes effect.
pub fn init() {
    let default_level = "warn";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
