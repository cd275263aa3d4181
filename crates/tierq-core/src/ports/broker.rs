//! Broker port: the shared queue / key-value store all workers talk to.
//!
//! The engine assumes, but does not implement, atomicity: `pop` must hand a
//! given job to exactly one caller. Every call is expected to return
//! promptly (non-blocking or short timeout).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BrokerError, JobId, PriorityTier, TaskId};

/// Metadata attached to a job at enqueue time and read back on dequeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub task_id: TaskId,
    pub priority: PriorityTier,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// One submission sitting on (or popped from) a broker queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Encoded task envelope.
    pub payload: Vec<u8>,
    pub meta: JobMeta,
    /// Execution timeout enforced by the broker/worker, not by the engine.
    pub timeout: Option<Duration>,
    /// Failure text reported by the worker that ran this job.
    pub exc_info: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, payload: Vec<u8>, meta: JobMeta, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            meta,
            timeout: None,
            exc_info: None,
            enqueued_at,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach the worker's failure output.
    pub fn failed_with(mut self, exc_info: impl Into<String>) -> Self {
        self.exc_info = Some(exc_info.into());
        self
    }

    /// Last non-blank line of the failure output, or "unknown error".
    pub fn failure_reason(&self) -> String {
        self.exc_info
            .as_deref()
            .and_then(|info| info.lines().rev().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Registry counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Ready to pop.
    pub pending: u64,
    /// Waiting for a retry time.
    pub deferred: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.deferred + self.started + self.finished + self.failed
    }
}

impl std::ops::AddAssign for QueueCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.pending += rhs.pending;
        self.deferred += rhs.deferred;
        self.started += rhs.started;
        self.finished += rhs.finished;
        self.failed += rhs.failed;
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a job to the tail of `queue`.
    async fn push(&self, queue: &str, job: Job) -> Result<(), BrokerError>;

    /// Make a job poppable from `queue` only after `delay`.
    async fn push_delayed(&self, queue: &str, job: Job, delay: Duration) -> Result<(), BrokerError>;

    /// Non-blocking pop from the head of `queue`.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, BrokerError>;

    /// Head of `queue` without removing it.
    async fn peek(&self, queue: &str) -> Result<Option<Job>, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError>;

    /// Record that a popped job completed.
    async fn mark_finished(&self, queue: &str, job_id: &JobId) -> Result<(), BrokerError>;

    /// Record that a popped job failed.
    async fn mark_failed(&self, queue: &str, job_id: &JobId) -> Result<(), BrokerError>;

    /// Store `value` under `key`; it disappears after `ttl`.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, BrokerError>;

    /// Reset the time-to-live of an existing key. Returns whether the key
    /// existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;
}
