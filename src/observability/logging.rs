//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber once per process
//! - Resolve the log filter from `RUST_LOG` first, then configuration
//!
//! # Design Decisions
//! - Human-readable fmt layer; fields carry the structure
//! - Re-initialization is reported, not fatal

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `default_level` is either a bare level (`"info"`) applied to this crate or a
/// full filter directive.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(default_level));

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
    {
        eprintln!("logging already initialized: {err}");
    }
}

fn default_filter(level: &str) -> EnvFilter {
    let directive = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("upstream_pool={level}")
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("upstream_pool=info"))
}
