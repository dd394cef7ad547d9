//! Least Connections load balancing strategy.

use crate::load_balancer::{Candidate, LoadBalancer};

/// Least connections selector.
/// Selects the candidate with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        // In case of tie, the first one is selected (stability)
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.active_requests)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::candidate;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();

        let candidates = vec![candidate(1, 5, 0.0), candidate(0, 50, 0.0)];
        assert_eq!(lb.select(&candidates), Some(1));

        // now the second has 2, the first has 1
        let candidates = vec![candidate(1, 5, 0.0), candidate(2, 50, 0.0)];
        assert_eq!(lb.select(&candidates), Some(0));
    }

    #[test]
    fn test_least_conn_tie_prefers_first() {
        let lb = LeastConnections::new();
        let candidates = vec![candidate(2, 0, 0.0), candidate(1, 0, 0.0), candidate(1, 0, 0.0)];
        assert_eq!(lb.select(&candidates), Some(1));
    }
}
