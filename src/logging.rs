// src/logging.rs
//! Tracing subscriber setup.
//!
//! Call [`init_logging`] once at startup, before [`crate::Server::serve`].
//! The level is taken from `RUST_LOG` (`info` when unset). Worker and
//! server lifecycle events log at `info`, per-connection activity at
//! `debug`/`trace`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with the level from `RUST_LOG`, defaulting to `info`.
///
/// # Panics
/// Panics if a global subscriber was already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit level, ignoring `RUST_LOG`.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
