//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → broadcast to health-check, idle-cleanup and stats loops
//!
//! Signals (signals.rs):
//!     SIGINT / Ctrl-C → caller triggers pool shutdown
//! ```
//!
//! # Design Decisions
//! - Shutdown is cooperative: loops exit at their next select point
//! - In-flight calls keep their handle and finish; later releases disconnect

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
