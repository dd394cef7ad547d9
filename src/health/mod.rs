//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! HealthChecker (checker.rs):
//!     Periodic timer
//!     → HealthTarget::run_health_check (the pool)
//!         → probe_all: force-probe every connection concurrently
//!         → evict idle failures, top up to min_size
//!     → HealthReport logged
//! ```
//!
//! # Design Decisions
//! - The checker holds a `Weak` target; dropping the pool ends the loop
//! - Leased connections that fail are left to the release path

pub mod checker;

pub use checker::{probe_all, HealthChecker, HealthReport, HealthTarget};
