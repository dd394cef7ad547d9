//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! caller → ConnectionPool::acquire(timeout)
//!     → (a) LoadBalancer picks an idle healthy connection → cached probe
//!             → probe failed: reconnect, or evict and pick again
//!     → (b) none available, below max_size: reserve slot, create + connect + warm up
//!     → (c) otherwise wait for a release (bounded by the poll interval)
//!     → PooledConnection lease
//!         → execute(op) → Connection::execute → RetryManager
//!             → terminal failure → ExceptionHandler (may reset the connection)
//!         → release / drop → back to idle, or disconnected if unhealthy
//! ```
//!
//! # Design Decisions
//! - One `std::sync::Mutex` guards membership and lease flags; never held across `.await`
//! - Per-connection counters are atomics
//! - Connections never reference the pool
//! - Background loops (health, idle cleanup, stats) hold a `Weak` pool reference

pub mod connection;
pub mod lease;
#[allow(clippy::module_inception)]
pub mod pool;

use std::time::Duration;

use thiserror::Error;

use crate::resilience::classifier::ErrorCategory;
use crate::resilience::retry::RetryFailure;

pub use connection::{Connection, ConnectionId, ConnectionSnapshot, ConnectionState};
pub use lease::PooledConnection;
pub use pool::{ConnectionPool, PoolCounters, PoolInfo, PoolPerformance, PoolStatus};

/// Failures of a single connection's lifecycle.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Every connect attempt failed.
    #[error("connect failed: {0}")]
    Connect(#[source] RetryFailure),

    #[error("warmup failed: none of {attempted} warmup call(s) succeeded: {last}")]
    Warmup { attempted: u32, last: String },

    #[error("connection unhealthy: {0}")]
    Unhealthy(String),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ConnectionError::Connect(failure) => Some(failure.category),
            ConnectionError::Warmup { .. } | ConnectionError::Unhealthy(_) | ConnectionError::Closed => {
                Some(ErrorCategory::Connection)
            }
            ConnectionError::InvalidTransition { .. } => None,
        }
    }
}

/// Failures of pool-level operations.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// No connection became available in time.
    #[error("no connection available after {waited:?} ({size}/{max_size} connections open)")]
    AcquireTimeout { waited: Duration, size: usize, max_size: usize },

    #[error("pool is shutting down")]
    ShuttingDown,

    #[error("failed to create connection: {0}")]
    Create(#[source] ConnectionError),

    /// The lease was already returned to the pool.
    #[error("connection lease already released")]
    Released,
}

impl PoolError {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            PoolError::AcquireTimeout { .. } | PoolError::ShuttingDown => Some(ErrorCategory::Resource),
            PoolError::Create(err) => err.category(),
            PoolError::Released => None,
        }
    }
}

/// Outcome of running an operation through a lease or the pool.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    /// The connection could not serve the call.
    #[error("connection unavailable: {0}")]
    Unavailable(#[source] ConnectionError),

    /// The operation failed after retries.
    #[error("operation failed: {0}")]
    Failed(#[source] RetryFailure),

    #[error("{0}")]
    Pool(#[from] PoolError),
}

impl ExecuteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecuteError::Unavailable(err) => err.category().unwrap_or(ErrorCategory::Connection),
            ExecuteError::Failed(failure) => failure.category,
            ExecuteError::Pool(err) => err.category().unwrap_or(ErrorCategory::Unknown),
        }
    }

    pub fn retry_failure(&self) -> Option<&RetryFailure> {
        match self {
            ExecuteError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
