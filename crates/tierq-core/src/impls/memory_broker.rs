//! In-memory broker for development, demos and tests.
//!
//! Nothing is persisted. Settled job ids are kept for a bounded history
//! and then folded into per-queue tallies, and expired keys are purged on
//! every write, so a long-running demo stays within bounded memory.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{BrokerError, JobId, TaskState};
use crate::ports::{Broker, Clock, Job, QueueCounts, SystemClock};

/// Settled job ids kept individually before they are folded into tallies.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Broker operations that can be made to fail with
/// [`InMemoryBroker::fail_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    Push,
    PushDelayed,
    Pop,
    Peek,
    Counts,
    MarkFinished,
    MarkFailed,
    Put,
    Get,
    Delete,
    Expire,
    Keys,
}

/// Delayed job entry for the schedule heap.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap (earliest first);
/// `seq` keeps jobs with the same ready time in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scheduled {
    ready_at: DateTime<Utc>,
    seq: u64,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MemoryState {
    queues: HashMap<String, VecDeque<Job>>,
    schedule: BinaryHeap<Scheduled>,
    delayed: HashMap<u64, (String, Job)>,
    next_seq: u64,
    /// Last known state of every live or recently settled job id, with the
    /// queue it belongs to.
    registry: HashMap<JobId, (String, TaskState)>,
    /// Settled ids in the order they settled, oldest first.
    history: VecDeque<JobId>,
    history_limit: usize,
    /// Finished and failed counts of ids dropped from the registry.
    archived: HashMap<String, QueueCounts>,
    kv: HashMap<String, (Vec<u8>, DateTime<Utc>)>,
    offline: bool,
    broken_queues: HashSet<String>,
    failing_ops: HashSet<BrokerOp>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            schedule: BinaryHeap::new(),
            delayed: HashMap::new(),
            next_seq: 0,
            registry: HashMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            archived: HashMap::new(),
            kv: HashMap::new(),
            offline: false,
            broken_queues: HashSet::new(),
            failing_ops: HashSet::new(),
        }
    }
}

impl MemoryState {
    fn check_queue(&self, op: BrokerOp, queue: &str) -> Result<(), BrokerError> {
        self.check_op(op)?;
        if self.broken_queues.contains(queue) {
            return Err(BrokerError::Unavailable(format!("queue '{queue}' is unreachable")));
        }
        Ok(())
    }

    fn check_op(&self, op: BrokerOp) -> Result<(), BrokerError> {
        if self.offline {
            return Err(BrokerError::Unavailable("in-memory broker is offline".into()));
        }
        if self.failing_ops.contains(&op) {
            return Err(BrokerError::Unavailable(format!("{op:?} is failing")));
        }
        Ok(())
    }

    /// Reject a second submission under an id that is queued, deferred or
    /// settled. A running job may be pushed back under its own id.
    fn check_new_id(&self, job_id: &JobId) -> Result<(), BrokerError> {
        match self.registry.get(job_id) {
            Some((_, state)) if *state != TaskState::Running => Err(BrokerError::Operation(
                format!("job id '{job_id}' is already in use ({state:?})"),
            )),
            _ => Ok(()),
        }
    }

    /// Move delayed jobs whose time has come onto their queues.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.schedule.peek() {
            if entry.ready_at > now {
                break;
            }
            let seq = entry.seq;
            self.schedule.pop();
            if let Some((queue, job)) = self.delayed.remove(&seq) {
                self.registry
                    .insert(job.id.clone(), (queue.clone(), TaskState::Queued));
                self.queues.entry(queue).or_default().push_back(job);
            }
        }
    }

    fn transition(
        &mut self,
        queue: &str,
        job_id: &JobId,
        next: TaskState,
    ) -> Result<(), BrokerError> {
        let Some((owner, state)) = self.registry.get_mut(job_id) else {
            return Err(BrokerError::Operation(format!("unknown job '{job_id}'")));
        };
        if owner.as_str() != queue {
            return Err(BrokerError::Operation(format!(
                "job '{job_id}' belongs to queue '{owner}', not '{queue}'"
            )));
        }
        if !state.can_transition_to(next) {
            return Err(BrokerError::Operation(format!(
                "job '{job_id}' cannot move from {state:?} to {next:?}"
            )));
        }
        *state = next;
        if matches!(next, TaskState::Succeeded | TaskState::Failed) {
            self.history.push_back(job_id.clone());
            self.trim_history();
        }
        Ok(())
    }

    /// Fold the oldest settled ids into `archived` until the history fits.
    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            let Some(job_id) = self.history.pop_front() else {
                break;
            };
            // the id may have been pushed again since it settled
            let settled = matches!(
                self.registry.get(&job_id),
                Some((_, TaskState::Succeeded | TaskState::Failed))
            );
            if !settled {
                continue;
            }
            if let Some((queue, state)) = self.registry.remove(&job_id) {
                let tally = self.archived.entry(queue).or_default();
                match state {
                    TaskState::Succeeded => tally.finished += 1,
                    _ => tally.failed += 1,
                }
            }
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.kv.retain(|_, (_, expires_at)| *expires_at > now);
    }

    fn live_value(&self, key: &str, now: DateTime<Utc>) -> Option<&Vec<u8>> {
        self.kv
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value)
    }
}

/// Broker kept entirely in process memory.
///
/// Queues are FIFO and delayed jobs sit in a time-ordered heap until due.
/// Keys expire lazily on read and are purged on write. Faults can be
/// injected with [`set_offline`], [`break_queue`] and [`fail_op`] to
/// exercise error paths.
///
/// [`set_offline`]: InMemoryBroker::set_offline
/// [`break_queue`]: InMemoryBroker::break_queue
/// [`fail_op`]: InMemoryBroker::fail_op
pub struct InMemoryBroker {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// Keep at most `limit` settled job ids individually queryable through
    /// [`job_state`](InMemoryBroker::job_state). Older ones only survive
    /// in the counts.
    pub fn with_history_limit(self, limit: usize) -> Self {
        let mut state = self.state.into_inner();
        state.history_limit = limit;
        Self {
            state: Mutex::new(state),
            clock: self.clock,
        }
    }

    /// Make every operation fail with `Unavailable`.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Make queue operations on `queue` fail with `Unavailable`.
    pub async fn break_queue(&self, queue: &str) {
        self.state.lock().await.broken_queues.insert(queue.to_string());
    }

    pub async fn repair_queue(&self, queue: &str) {
        self.state.lock().await.broken_queues.remove(queue);
    }

    /// Make every call of `op` fail with `Unavailable` until restored.
    pub async fn fail_op(&self, op: BrokerOp) {
        self.state.lock().await.failing_ops.insert(op);
    }

    pub async fn restore_op(&self, op: BrokerOp) {
        self.state.lock().await.failing_ops.remove(&op);
    }

    /// Last recorded state of a job, while it is still in the history.
    pub async fn job_state(&self, job_id: &JobId) -> Option<TaskState> {
        let state = self.state.lock().await;
        state.registry.get(job_id).map(|(_, s)| *s)
    }

    /// Number of jobs waiting on `queue`, ready or delayed.
    pub async fn queued_len(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        state.promote_due(self.clock.now());
        let ready = state.queues.get(queue).map_or(0, VecDeque::len);
        let delayed = state.delayed.values().filter(|(q, _)| q == queue).count();
        ready + delayed
    }

    /// Stored keys, expired or not.
    pub async fn stored_keys(&self) -> usize {
        self.state.lock().await.kv.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push(&self, queue: &str, job: Job) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::Push, queue)?;
        state.check_new_id(&job.id)?;
        state
            .registry
            .insert(job.id.clone(), (queue.to_string(), TaskState::Queued));
        state.queues.entry(queue.to_string()).or_default().push_back(job);
        Ok(())
    }

    async fn push_delayed(&self, queue: &str, job: Job, delay: Duration) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::PushDelayed, queue)?;
        state.check_new_id(&job.id)?;

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .registry
            .insert(job.id.clone(), (queue.to_string(), TaskState::Deferred));
        state.delayed.insert(seq, (queue.to_string(), job));
        state.schedule.push(Scheduled {
            ready_at: expiry(now, delay),
            seq,
        });
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::Pop, queue)?;
        state.promote_due(now);

        let Some(job) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        state
            .registry
            .insert(job.id.clone(), (queue.to_string(), TaskState::Running));
        Ok(Some(job))
    }

    async fn peek(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::Peek, queue)?;
        state.promote_due(now);
        Ok(state.queues.get(queue).and_then(|q| q.front().cloned()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::Counts, queue)?;
        state.promote_due(now);

        let mut counts = state.archived.get(queue).copied().unwrap_or_default();
        for (owner, job_state) in state.registry.values() {
            if owner.as_str() != queue {
                continue;
            }
            match job_state {
                TaskState::Queued => counts.pending += 1,
                TaskState::Deferred => counts.deferred += 1,
                TaskState::Running => counts.started += 1,
                TaskState::Succeeded => counts.finished += 1,
                TaskState::Failed => counts.failed += 1,
                // dead letters live in the key space, not on a queue
                TaskState::DeadLettered => {}
            }
        }
        Ok(counts)
    }

    async fn mark_finished(&self, queue: &str, job_id: &JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::MarkFinished, queue)?;
        state.transition(queue, job_id, TaskState::Succeeded)
    }

    async fn mark_failed(&self, queue: &str, job_id: &JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_queue(BrokerOp::MarkFailed, queue)?;
        state.transition(queue, job_id, TaskState::Failed)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_op(BrokerOp::Put)?;
        state.purge_expired(now);
        state.kv.insert(key.to_string(), (value, expiry(now, ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state.check_op(BrokerOp::Get)?;
        Ok(state.live_value(key, now).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_op(BrokerOp::Delete)?;
        Ok(state
            .kv
            .remove(key)
            .is_some_and(|(_, expires_at)| expires_at > now))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_op(BrokerOp::Expire)?;
        match state.kv.get_mut(key) {
            Some((_, expires_at)) if *expires_at > now => {
                *expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_op(BrokerOp::Keys)?;
        state.purge_expired(now);

        let mut keys: Vec<String> = state
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
