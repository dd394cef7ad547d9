//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Pool, connections, retry and exception handling produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via the `metrics` facade)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG / config)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are fire-and-forget; without an installed recorder they are no-ops
//! - Category and event labels are static strings, never free-form text

pub mod logging;
pub mod metrics;
