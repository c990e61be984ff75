//! Tracing subscriber setup
//!
//! Hosts call [`init_tracing`] once at startup. The filter comes from
//! `RUST_LOG` and falls back to `info`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Build the filter from `RUST_LOG`, or `default` when unset or invalid
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global fmt subscriber. Returns `false` if one was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_target(true)
        .try_init()
        .is_ok()
}
