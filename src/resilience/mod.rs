//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call through a connection:
//!     → retry.rs (per-attempt timeout, bounded attempts)
//!         → classifier.rs (category decides whether to retry)
//!         → backoff.rs (delay between attempts)
//!     → terminal failure: exceptions.rs (record, log by severity)
//!         → recovery.rs (strategy-specific actions, e.g. reset connection)
//! ```
//!
//! # Design Decisions
//! - Classification happens once per failure and is threaded through
//! - Backoff is applied only inside the retry loop
//! - Escalated failures are never auto-recovered

pub mod backoff;
pub mod classifier;
pub mod exceptions;
pub mod recovery;
pub mod retry;

pub use classifier::{Classification, ClassificationRule, ErrorCategory, ErrorClassifier, RecoveryStrategy, Severity};
pub use exceptions::{ExceptionContext, ExceptionHandler, ExceptionRecord, ExceptionStats};
pub use recovery::{Reconnect, RecoveryAction, RecoveryContext, RecoveryError, RecoveryManager};
pub use retry::{RetryAttempt, RetryFailure, RetryManager, RetryResult, RetryStats};
