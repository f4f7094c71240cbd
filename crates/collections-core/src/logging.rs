//! Logger setup shared by every binary.
//!
//! Mirrors the standalone `logger` crate's configuration: compact
//! formatting to stdout, `RUST_LOG`-driven target filtering, INFO as the
//! default level when the agent starts with no explicit filter.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initializes the global `tracing` subscriber. Panics if a logger is
/// already installed; binaries call this exactly once, at the top of
/// `main`.
pub fn init() {
    try_init().expect("failed to install global logger");
}

/// Fallible variant, useful in tests where multiple threads may race to
/// install the subscriber.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| Targets::from_str(&raw).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
