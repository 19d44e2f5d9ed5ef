//! Destination selection among equivalent rules
//!
//! When several rules share the same `(server, src)` group, the balancer
//! picks one of the alive destinations according to the configured policy.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load-balancing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LbPolicy {
    #[default]
    Random,
    Failover,
    RoundRobin,
}

/// Uniform random pick over the alive subset
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn select(&self, alive: &[usize]) -> Option<usize> {
        if alive.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..alive.len());
        Some(alive[idx])
    }
}

/// First alive destination in snapshot order
#[derive(Debug, Default)]
pub struct FailoverSelector;

impl FailoverSelector {
    pub fn select(&self, alive: &[usize]) -> Option<usize> {
        alive.first().copied()
    }
}

/// Monotonic per-group counter modulo the alive subset size.
///
/// Counters are keyed by group so unrelated sources do not share a rotation.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn select(&self, group_key: &str, alive: &[usize]) -> Option<usize> {
        if alive.is_empty() {
            return None;
        }
        let counter = self
            .counters
            .entry(group_key.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let n = counter.fetch_add(1, Ordering::Relaxed);
        Some(alive[n % alive.len()])
    }
}

/// Policy-driven selector facade used by the pipeline
#[derive(Debug)]
pub enum Selector {
    Random(RandomSelector),
    Failover(FailoverSelector),
    RoundRobin(RoundRobinSelector),
}

impl Selector {
    pub fn new(policy: LbPolicy) -> Self {
        match policy {
            LbPolicy::Random => Self::Random(RandomSelector),
            LbPolicy::Failover => Self::Failover(FailoverSelector),
            LbPolicy::RoundRobin => Self::RoundRobin(RoundRobinSelector::default()),
        }
    }

    /// Pick an index from `alive` (indexes into the rule group).
    ///
    /// An empty alive subset yields `None`; the caller falls through to the
    /// group's first rule so the client sees the genuine upstream error.
    pub fn pick(&self, group_key: &str, alive: &[usize]) -> Option<usize> {
        match self {
            Self::Random(s) => s.select(alive),
            Self::Failover(s) => s.select(alive),
            Self::RoundRobin(s) => s.select(group_key, alive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stays_within_alive_subset() {
        let selector = RandomSelector;
        for _ in 0..50 {
            let picked = selector.select(&[1, 3]).unwrap();
            assert!(picked == 1 || picked == 3);
        }
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn failover_picks_first_alive() {
        let selector = FailoverSelector;
        assert_eq!(selector.select(&[2, 4]), Some(2));
        assert_eq!(selector.select(&[0]), Some(0));
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn round_robin_rotates_per_group() {
        let selector = RoundRobinSelector::default();
        let picks: Vec<_> = (0..4)
            .map(|_| selector.select("g1", &[0, 1]).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);

        // a different group starts its own rotation
        assert_eq!(selector.select("g2", &[0, 1]), Some(0));
    }

    #[test]
    fn round_robin_adapts_to_shrunken_subset() {
        let selector = RoundRobinSelector::default();
        selector.select("g", &[0, 1, 2]);
        selector.select("g", &[0, 1, 2]);
        // one destination died; rotation keeps cycling the remainder
        let picked = selector.select("g", &[0, 2]).unwrap();
        assert!(picked == 0 || picked == 2);
    }
}
