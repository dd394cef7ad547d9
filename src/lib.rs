//! Resilient connection pool for flaky, rate-limited upstreams.

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod upstream;

pub use config::schema::ServiceConfig;
pub use lifecycle::Shutdown;
pub use load_balancer::LoadBalanceStrategy;
pub use pool::{ConnectionPool, ExecuteError, PoolError, PooledConnection};
pub use resilience::{ErrorCategory, ErrorClassifier, ExceptionHandler, RecoveryManager, RetryManager};
pub use upstream::{Upstream, UpstreamError};
