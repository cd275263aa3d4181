//! Ledger records kept next to the queues: retry bookkeeping and the
//! dead-letter archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, PriorityTier, TaskEnvelope, TaskId};
use crate::queue::RetryPolicy;

/// Side ledger entry for a task that failed at least once.
///
/// Keyed by task id; overwritten on every further failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub task_id: TaskId,
    /// Failure count after this failure.
    pub retry_count: u32,
    pub next_retry_time: DateTime<Utc>,
    pub original_priority: PriorityTier,
    pub failure_reason: String,
    /// Policy in effect when the retry was scheduled.
    pub policy: RetryPolicy,
}

impl RetryRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time <= now
    }

    /// Time left until the retry may run; zero once due.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_retry_time - now).to_std().unwrap_or_default()
    }
}

/// Terminal record for a task that exhausted its retry budget.
///
/// Holds the original task arguments so an operator can resubmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: TaskId,
    /// Broker job that failed last.
    pub job_id: JobId,
    pub original_priority: PriorityTier,
    pub final_retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: String,
    pub task: TaskEnvelope,
}
