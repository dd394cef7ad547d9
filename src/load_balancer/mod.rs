//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! pool.acquire()
//!     → snapshot idle, healthy connections below the concurrency ceiling
//!     → LoadBalancer::select(&[Candidate]) picks one index:
//!         - round_robin.rs (rotate through candidates)
//!         - least_conn.rs (fewest in-flight requests)
//!         - fastest.rs (lowest average response time)
//!         - random.rs (uniform choice)
//!         - adaptive.rs (lowest load score)
//!     → pool leases the chosen connection
//! ```
//!
//! # Design Decisions
//! - Strategies see plain snapshots, never connections or the pool lock
//! - Filtering (health, lease, ceiling) happens in the pool before selection
//! - Ties resolve to the first candidate for stability

pub mod adaptive;
pub mod fastest;
pub mod least_conn;
pub mod random;
pub mod round_robin;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use adaptive::Adaptive;
pub use fastest::FastestResponse;
pub use least_conn::LeastConnections;
pub use random::RandomChoice;
pub use round_robin::RoundRobin;

/// Point-in-time view of a selectable connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub active_requests: usize,
    pub avg_response_time: Duration,
    pub load_score: f64,
}

/// Strategy trait for picking a connection.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Index into `candidates` of the chosen connection, `None` if empty.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;
}

/// Configured selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    LeastConnections,
    FastestResponse,
    Random,
    #[default]
    Adaptive,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::LeastConnections => "least_connections",
            LoadBalanceStrategy::FastestResponse => "fastest_response",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::Adaptive => "adaptive",
        }
    }

    /// Instantiate the strategy.
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
            LoadBalanceStrategy::LeastConnections => Box::new(LeastConnections::new()),
            LoadBalanceStrategy::FastestResponse => Box::new(FastestResponse::new()),
            LoadBalanceStrategy::Random => Box::new(RandomChoice::new()),
            LoadBalanceStrategy::Adaptive => Box::new(Adaptive::new()),
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
pub(crate) fn candidate(active_requests: usize, avg_ms: u64, load_score: f64) -> Candidate {
    Candidate {
        active_requests,
        avg_response_time: Duration::from_millis(avg_ms),
        load_score,
    }
}
