//! Log output setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

/// Build the filter: `RUST_LOG` wins, then `fallback`, then `info`.
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a fmt subscriber writing to stderr.
///
/// Returns false if a global subscriber was already installed, which makes
/// repeated calls (e.g. from several tests) harmless.
pub fn init(logging: &LoggingSection) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&logging.filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
