//! Adaptive load balancing strategy.
//!
//! Chooses the candidate with the lowest load score, a weighted blend of
//! in-flight requests, average latency, failure rate and consecutive
//! failures computed by the connection itself.

use std::cmp::Ordering;

use crate::load_balancer::{Candidate, LoadBalancer};

#[derive(Debug, Default)]
pub struct Adaptive;

impl Adaptive {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Adaptive {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.load_score.partial_cmp(&b.load_score).unwrap_or(Ordering::Equal))
            .map(|(i, _)| i)
    }
}
