//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::{Candidate, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter advanced on every call.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        // The candidate list changes between calls; the index only needs to rotate.
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::candidate;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let candidates = vec![candidate(0, 10, 0.0), candidate(0, 10, 0.0), candidate(0, 10, 0.0)];

        let picks: Vec<usize> = (0..6).filter_map(|_| lb.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_shrinking_list() {
        let lb = RoundRobin::new();
        let three = vec![candidate(0, 0, 0.0); 3];
        let two = vec![candidate(0, 0, 0.0); 2];

        assert_eq!(lb.select(&three), Some(0));
        assert_eq!(lb.select(&three), Some(1));
        assert_eq!(lb.select(&two), Some(0));
        assert_eq!(lb.select(&two), Some(1));
    }
}
