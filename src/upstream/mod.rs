//! Upstream data source contract.
//!
//! # Responsibilities
//! - Define what the pool needs from the remote source (`Upstream`)
//! - Define the failures an upstream may report (`UpstreamError`)
//!
//! # Design Decisions
//! - The upstream handle is owned by exactly one `Connection`
//! - Operations receive an `Arc` of the handle so in-flight calls survive a
//!   concurrent disconnect
//! - Typed error variants carry their category; `Other` is classified from text

pub mod simulated;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::classifier::ErrorCategory;

/// Failures reported by an upstream or by the retry wrapper around it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid data: {0}")]
    Data(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Untyped failure; the classifier inspects its text.
    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    pub fn other(message: impl Into<String>) -> Self {
        UpstreamError::Other(message.into())
    }

    /// Category declared by the variant, if any.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            UpstreamError::ConnectionLost(_) => Some(ErrorCategory::Connection),
            UpstreamError::ConnectionRefused(_) | UpstreamError::Network(_) => Some(ErrorCategory::Network),
            UpstreamError::Timeout(_) => Some(ErrorCategory::Timeout),
            UpstreamError::RateLimited(_) => Some(ErrorCategory::RateLimit),
            UpstreamError::Server { status, .. } if *status >= 500 => Some(ErrorCategory::Server),
            UpstreamError::Server { status: 429, .. } => Some(ErrorCategory::RateLimit),
            UpstreamError::Server { status: 401 | 403, .. } => Some(ErrorCategory::Authentication),
            UpstreamError::Server { .. } => Some(ErrorCategory::Data),
            UpstreamError::Authentication(_) => Some(ErrorCategory::Authentication),
            UpstreamError::Data(_) => Some(ErrorCategory::Data),
            UpstreamError::Resource(_) => Some(ErrorCategory::Resource),
            UpstreamError::Other(_) => None,
        }
    }
}

/// The remote source behind the pool.
///
/// Implementations are shared by every connection of a pool, so they must be
/// cheap to call concurrently. Each successful `connect` yields a handle that
/// belongs to a single connection until `disconnect`.
pub trait Upstream: Send + Sync + 'static {
    /// Raw per-connection state (socket, session, client).
    type Handle: Send + Sync + 'static;

    /// Open a new handle.
    fn connect(&self) -> impl Future<Output = Result<Self::Handle, UpstreamError>> + Send;

    /// Release server-side state held by the handle.
    fn disconnect(&self, handle: &Self::Handle) -> impl Future<Output = ()> + Send;

    /// Cheap capability probe; no full round trip expected.
    fn is_alive(&self, handle: &Self::Handle) -> impl Future<Output = bool> + Send;

    /// Lightweight synthetic call issued while a connection warms up.
    fn warmup(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), UpstreamError>> + Send {
        async move {
            if self.is_alive(handle).await {
                Ok(())
            } else {
                Err(UpstreamError::ConnectionLost("warmup probe failed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_categories() {
        assert_eq!(
            UpstreamError::ConnectionRefused("x".into()).category(),
            Some(ErrorCategory::Network)
        );
        assert_eq!(
            UpstreamError::ConnectionLost("x".into()).category(),
            Some(ErrorCategory::Connection)
        );
        assert_eq!(
            UpstreamError::Server { status: 503, message: "down".into() }.category(),
            Some(ErrorCategory::Server)
        );
        assert_eq!(
            UpstreamError::Server { status: 429, message: "slow down".into() }.category(),
            Some(ErrorCategory::RateLimit)
        );
        assert_eq!(
            UpstreamError::Server { status: 403, message: "no".into() }.category(),
            Some(ErrorCategory::Authentication)
        );
        assert_eq!(UpstreamError::other("???").category(), None);
    }

    #[test]
    fn test_error_display() {
        let err = UpstreamError::Server { status: 502, message: "bad gateway".into() };
        assert_eq!(err.to_string(), "server error 502: bad gateway");
    }
}
