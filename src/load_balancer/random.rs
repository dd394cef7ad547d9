//! Uniform random load balancing strategy.

use crate::load_balancer::{Candidate, LoadBalancer};

#[derive(Debug, Default)]
pub struct RandomChoice;

impl RandomChoice {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomChoice {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(fastrand::usize(..candidates.len()))
    }
}
