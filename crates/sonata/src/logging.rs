// src/logging.rs
//! Tracing subscriber setup.
//!
//! The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug sonata --root ./www     # per-request and per-tick detail
//! RUST_LOG=sonata=info,warn sonata       # default
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber, reading `RUST_LOG` and defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already set. Use [`try_init_logging`]
/// where that can happen (tests).
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], with `level` as the fallback when `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Install the subscriber unless one is already set. Returns whether it was installed.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
