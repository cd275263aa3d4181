//! Per-tier rotating counters.
//!
//! Process local: several handler instances on one broker each keep their
//! own counters, so these give no fairness guarantee across workers. They
//! are advanced on every successful pop and reported in statistics; dequeue
//! order is fully decided by tier and FIFO.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::domain::PriorityTier;

/// Counters wrap back to zero at this value.
pub const ROUND_ROBIN_MODULUS: u32 = 1000;

#[derive(Debug, Default)]
pub struct RoundRobinCounters {
    counters: [AtomicU32; PriorityTier::ALL.len()],
}

impl RoundRobinCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step the tier's counter; returns the new value.
    pub fn advance(&self, tier: PriorityTier) -> u32 {
        let counter = &self.counters[tier.rank()];
        let previous = counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some((n + 1) % ROUND_ROBIN_MODULUS)
            })
            .unwrap_or_default();
        (previous + 1) % ROUND_ROBIN_MODULUS
    }

    pub fn get(&self, tier: PriorityTier) -> u32 {
        self.counters[tier.rank()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<PriorityTier, u32> {
        PriorityTier::ALL
            .iter()
            .map(|&tier| (tier, self.get(tier)))
            .collect()
    }
}
