//! Queue statistics snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::PriorityTier;
use crate::ports::QueueCounts;

/// Counts for one tier, or the reason they could not be read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatistics {
    pub queue: String,
    /// `None` when the broker could not be queried for this tier.
    pub counts: Option<QueueCounts>,
    /// Enqueue time of the job at the head of the queue.
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TierStatistics {
    pub fn ok(queue: impl Into<String>, counts: QueueCounts) -> Self {
        Self {
            queue: queue.into(),
            counts: Some(counts),
            oldest_enqueued_at: None,
            error: None,
        }
    }

    pub fn failed(queue: impl Into<String>, error: impl ToString) -> Self {
        Self {
            queue: queue.into(),
            counts: None,
            oldest_enqueued_at: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Snapshot returned by `get_queue_statistics`.
///
/// Totals only include tiers whose counts were read; check
/// [`is_partial`](Self::is_partial) before trusting them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub tiers: BTreeMap<PriorityTier, TierStatistics>,
    pub totals: QueueCounts,
    pub round_robin: BTreeMap<PriorityTier, u32>,
    /// Live dead-letter records; `None` if the key space could not be read.
    pub dead_lettered: Option<usize>,
    pub collected_at: Option<DateTime<Utc>>,
}

impl QueueStatistics {
    pub fn record(&mut self, tier: PriorityTier, stats: TierStatistics) {
        if let Some(counts) = stats.counts {
            self.totals += counts;
        }
        self.tiers.insert(tier, stats);
    }

    pub fn is_partial(&self) -> bool {
        self.dead_lettered.is_none() || self.tiers.values().any(TierStatistics::is_partial)
    }

    pub fn pending(&self, tier: PriorityTier) -> Option<u64> {
        self.tiers.get(&tier)?.counts.map(|c| c.pending)
    }
}
