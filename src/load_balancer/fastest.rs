//! Fastest-response load balancing strategy.

use crate::load_balancer::{Candidate, LoadBalancer};

/// Picks the candidate with the lowest average response time.
///
/// Connections without samples report zero and are therefore tried first.
#[derive(Debug, Default)]
pub struct FastestResponse;

impl FastestResponse {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for FastestResponse {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.avg_response_time)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::candidate;

    #[test]
    fn test_fastest() {
        let lb = FastestResponse::new();
        let candidates = vec![candidate(0, 120, 0.0), candidate(5, 15, 0.0), candidate(0, 40, 0.0)];
        assert_eq!(lb.select(&candidates), Some(1));
    }
}
