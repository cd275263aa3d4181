//! PriorityQueueHandler: dispatch by tier, retry scheduling and the
//! dead-letter archive, all on top of an injected [`Broker`].
//!
//! Every public operation catches failures at its own boundary and logs
//! them with the task id, tier and operation. Results are still explicit:
//! a caller can tell "no work" ([`Dequeued::Empty`]) from "broker trouble"
//! ([`Dequeued::Unavailable`]).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::retry::{RetryPolicy, backoff_delay};
use super::round_robin::RoundRobinCounters;
use super::stats::{QueueStatistics, TierStatistics};
use crate::app::config::{ConfigError, EngineConfig, QueueTopology};
use crate::codec::TaskSerializer;
use crate::domain::{
    DeadLetterRecord, EngineError, JobId, PriorityTier, RetryRecord, Task, TaskEnvelope, TaskId,
};
use crate::ports::{Broker, Clock, Job, JobMeta};

/// A task handed to a worker, with the broker job it came from.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub task: Task,
    pub job: Job,
    pub tier: PriorityTier,
    pub queue: String,
}

impl DispatchedTask {
    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }
}

/// Result of asking for the next task.
#[derive(Debug)]
pub enum Dequeued {
    Ready(DispatchedTask),
    /// Every accepted tier was reachable and empty.
    Empty,
    /// Nothing was dispatched and at least one tier failed.
    Unavailable(Vec<EngineError>),
}

impl Dequeued {
    pub fn into_ready(self) -> Option<DispatchedTask> {
        match self {
            Dequeued::Ready(task) => Some(task),
            _ => None,
        }
    }
}

/// Result of reporting a failed job.
#[derive(Debug)]
pub enum RequeueOutcome {
    /// Resubmitted to its original tier after `delay_secs`.
    Retried {
        job_id: JobId,
        delay_secs: u64,
        retry_count: u32,
    },
    /// Budget exhausted; archived and not resubmitted.
    DeadLettered,
    Failed(EngineError),
}

impl RequeueOutcome {
    pub fn is_retried(&self) -> bool {
        matches!(self, RequeueOutcome::Retried { .. })
    }
}

pub struct PriorityQueueHandler {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    serializer: TaskSerializer,
    topology: QueueTopology,
    config: EngineConfig,
    round_robin: RoundRobinCounters,
}

impl PriorityQueueHandler {
    pub fn new(
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            broker,
            clock,
            serializer: TaskSerializer::new(config.wire_format),
            topology: config.topology(),
            config,
            round_robin: RoundRobinCounters::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    fn queue_for(&self, tier: PriorityTier) -> Result<&str, EngineError> {
        self.topology
            .queue_for(tier)
            .ok_or_else(|| EngineError::tier_not_found(tier))
    }

    /// Next task from the highest non-empty tier in `worker_tiers`.
    ///
    /// Tiers are walked Urgent to Low and the first successful pop wins.
    /// A tier whose broker call fails is skipped; a deferred retry whose
    /// time has not come is pushed back and the walk moves on.
    pub async fn get_next_task(&self, worker_tiers: &[PriorityTier]) -> Dequeued {
        let mut errors = Vec::new();

        for tier in PriorityTier::ALL {
            if !worker_tiers.contains(&tier) {
                continue;
            }
            let queue = match self.queue_for(tier) {
                Ok(queue) => queue,
                Err(err) => {
                    tracing::warn!(op = "get_next_task", %tier, error = %err, "worker accepts an unbound tier");
                    errors.push(err);
                    continue;
                }
            };

            match self.pop_ready(tier, queue).await {
                Ok(Some(dispatched)) => return Dequeued::Ready(dispatched),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(op = "get_next_task", %tier, queue, error = %err, "tier skipped");
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Dequeued::Empty
        } else {
            Dequeued::Unavailable(errors)
        }
    }

    /// Pop one job from `queue` and turn it into a dispatchable task.
    ///
    /// Only the pop itself may fail the call. Once a job is out of the
    /// queue it is either dispatched, pushed back or marked failed.
    async fn pop_ready(
        &self,
        tier: PriorityTier,
        queue: &str,
    ) -> Result<Option<DispatchedTask>, EngineError> {
        let Some(job) = self.broker.pop(queue).await? else {
            return Ok(None);
        };
        self.round_robin.advance(tier);

        if job.meta.retry_count > 0 {
            let now = self.clock.now();
            let record = match self.load_retry_record(job.meta.task_id).await {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(task_id = %job.meta.task_id, job_id = %job.id, %tier, error = %err, "retry record unreadable, treating job as due");
                    None
                }
            };
            if let Some(record) = record
                && !record.is_due(now)
            {
                let remaining = record.remaining(now);
                tracing::debug!(
                    task_id = %job.meta.task_id,
                    job_id = %job.id,
                    %tier,
                    wait_secs = remaining.as_secs(),
                    "retry not due yet, deferring"
                );
                // a job that could not be put back runs early
                let Some(job) = self.defer(queue, job, remaining).await else {
                    return Ok(None);
                };
                return Ok(self.decode_job(tier, queue, job).await);
            }
        }

        Ok(self.decode_job(tier, queue, job).await)
    }

    /// Put a popped job back until `delay` has passed, or straight back on
    /// its queue if delaying fails. Hands the job back when neither push
    /// succeeded.
    async fn defer(&self, queue: &str, job: Job, delay: Duration) -> Option<Job> {
        let task_id = job.meta.task_id;
        let err = match self.broker.push_delayed(queue, job.clone(), delay).await {
            Ok(()) => {
                let key = self.config.retry_key(task_id);
                if let Err(err) = self.broker.expire(&key, self.config.retry_ttl()).await {
                    tracing::warn!(%task_id, error = %err, "could not refresh retry record ttl");
                }
                return None;
            }
            Err(err) => err,
        };
        tracing::warn!(%task_id, job_id = %job.id, queue, error = %err, "could not defer job, requeueing it now");
        match self.broker.push(queue, job.clone()).await {
            Ok(()) => None,
            Err(err) => {
                tracing::error!(%task_id, job_id = %job.id, queue, error = %err, "could not requeue job, dispatching it early");
                Some(job)
            }
        }
    }

    async fn decode_job(&self, tier: PriorityTier, queue: &str, job: Job) -> Option<DispatchedTask> {
        let mut task = match self.serializer.deserialize_task(&job.payload) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    task_id = %job.meta.task_id,
                    %tier,
                    error = %err,
                    "dropping job with undecodable payload"
                );
                if let Err(err) = self.broker.mark_failed(queue, &job.id).await {
                    tracing::warn!(job_id = %job.id, error = %err, "could not mark undecodable job failed");
                }
                return None;
            }
        };
        task.retry_count = job.meta.retry_count;

        tracing::debug!(task_id = %task.task_id, job_id = %job.id, %tier, "dispatching task");
        Some(DispatchedTask {
            task,
            job,
            tier,
            queue: queue.to_string(),
        })
    }

    /// Submit `task` to the queue of `tier`.
    ///
    /// `timeout` falls back to the configured job timeout. The job id is
    /// the task id, so a task can be enqueued this way only once.
    pub async fn enqueue_by_priority(
        &self,
        task: &Task,
        tier: PriorityTier,
        timeout: Option<Duration>,
    ) -> Result<JobId, EngineError> {
        let result = self
            .try_enqueue(task, tier, timeout, JobId::for_task(task.task_id))
            .await;
        match &result {
            Ok(job_id) => {
                tracing::info!(task_id = %task.task_id, %job_id, %tier, "task enqueued");
            }
            Err(err) => {
                tracing::error!(op = "enqueue_by_priority", task_id = %task.task_id, %tier, error = %err, "enqueue failed");
            }
        }
        result
    }

    async fn try_enqueue(
        &self,
        task: &Task,
        tier: PriorityTier,
        timeout: Option<Duration>,
        job_id: JobId,
    ) -> Result<JobId, EngineError> {
        let queue = self.queue_for(tier)?;
        let payload = self.serializer.serialize_task(task)?;
        let job = Job::new(
            job_id,
            payload,
            JobMeta {
                task_id: task.task_id,
                priority: tier,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            },
            self.clock.now(),
        )
        .with_timeout(timeout.or(self.config.job_timeout()));

        let job_id = job.id.clone();
        self.broker.push(queue, job).await?;
        Ok(job_id)
    }

    /// Report a failed job: schedule a retry with backoff, or dead-letter
    /// it once its budget is spent.
    pub async fn requeue_failed_task(&self, job: Job, policy: &RetryPolicy) -> RequeueOutcome {
        let task_id = job.meta.task_id;
        let tier = job.meta.priority;

        let queue = match self.queue_for(tier) {
            Ok(queue) => queue,
            Err(err) => {
                tracing::error!(op = "requeue_failed_task", %task_id, %tier, error = %err, "original tier unresolvable");
                return RequeueOutcome::Failed(err);
            }
        };

        if let Err(err) = self.broker.mark_failed(queue, &job.id).await {
            tracing::warn!(%task_id, job_id = %job.id, %tier, error = %err, "could not mark job failed");
        }

        let retry_count = job.meta.retry_count;
        let max_retries = job.meta.max_retries;
        if retry_count >= max_retries {
            let signal = EngineError::RetryBudgetExceeded {
                task_id,
                retry_count,
                max_retries,
            };
            tracing::warn!(%task_id, %tier, reason = %signal, "moving task to dead letters");
            return match self.dead_letter_job(job).await {
                Ok(()) => RequeueOutcome::DeadLettered,
                Err(err) => RequeueOutcome::Failed(err),
            };
        }

        match self.schedule_retry(job, queue, policy).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(op = "requeue_failed_task", %task_id, %tier, error = %err, "retry scheduling failed");
                RequeueOutcome::Failed(err)
            }
        }
    }

    /// Push the retry job, then record when it is due.
    ///
    /// A retry job that cannot be pushed sends the failed job to the
    /// dead letters instead, where it can still be resubmitted. A record
    /// that cannot be written only costs the early-pop check; the broker
    /// already holds the job back for its delay.
    async fn schedule_retry(
        &self,
        job: Job,
        queue: &str,
        policy: &RetryPolicy,
    ) -> Result<RequeueOutcome, EngineError> {
        let meta = &job.meta;
        let next_count = meta.retry_count + 1;
        let delay_secs = backoff_delay(meta.retry_count, policy);
        let now = self.clock.now();

        let mut task = self.serializer.deserialize_task(&job.payload)?;
        task.retry_count = next_count;
        let retry_job = Job::new(
            job.id.retry(next_count),
            self.serializer.serialize_task(&task)?,
            JobMeta {
                retry_count: next_count,
                ..meta.clone()
            },
            now,
        )
        .with_timeout(job.timeout);
        let job_id = retry_job.id.clone();

        if let Err(err) = self
            .broker
            .push_delayed(queue, retry_job, Duration::from_secs(delay_secs))
            .await
        {
            tracing::error!(task_id = %meta.task_id, %job_id, error = %err, "could not push retry job, dead-lettering instead");
            return match self.dead_letter_job(job).await {
                Ok(()) => Ok(RequeueOutcome::DeadLettered),
                Err(_) => Err(err.into()),
            };
        }

        let record = RetryRecord {
            task_id: meta.task_id,
            retry_count: next_count,
            next_retry_time: after(now, delay_secs),
            original_priority: meta.priority,
            failure_reason: job.failure_reason(),
            policy: policy.clone(),
        };
        let key = self.config.retry_key(meta.task_id);
        let written = match self.serializer.encode_record(&record) {
            Ok(bytes) => self
                .broker
                .put(&key, bytes, self.config.retry_ttl())
                .await
                .map_err(EngineError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = written {
            tracing::warn!(task_id = %meta.task_id, %job_id, error = %err, "retry job queued without a retry record");
        }

        tracing::info!(
            task_id = %meta.task_id,
            %job_id,
            tier = %meta.priority,
            retry_count = next_count,
            delay_secs,
            reason = %record.failure_reason,
            "retry scheduled"
        );
        Ok(RequeueOutcome::Retried {
            job_id,
            delay_secs,
            retry_count: next_count,
        })
    }

    /// Archive `job` as a dead letter and drop its retry record.
    ///
    /// Overwrites any existing record for the task, so running it twice
    /// for the same job is harmless. Does not touch the job's queue state.
    pub async fn dead_letter_job(&self, job: Job) -> Result<(), EngineError> {
        let task_id = job.meta.task_id;
        let result = self.try_dead_letter(&job).await;
        match &result {
            Ok(()) => {
                tracing::warn!(
                    %task_id,
                    job_id = %job.id,
                    tier = %job.meta.priority,
                    retry_count = job.meta.retry_count,
                    "task dead-lettered"
                );
            }
            Err(err) => {
                tracing::error!(op = "dead_letter_job", %task_id, job_id = %job.id, error = %err, "dead-letter transition failed");
            }
        }
        result
    }

    async fn try_dead_letter(&self, job: &Job) -> Result<(), EngineError> {
        let task = self.serializer.deserialize_task(&job.payload)?;
        let record = DeadLetterRecord {
            task_id: job.meta.task_id,
            job_id: job.id.clone(),
            original_priority: job.meta.priority,
            final_retry_count: job.meta.retry_count,
            failed_at: self.clock.now(),
            failure_reason: job.failure_reason(),
            task: TaskEnvelope::from(&task),
        };
        self.broker
            .put(
                &self.config.dead_letter_key(record.task_id),
                self.serializer.encode_record(&record)?,
                self.config.dead_letter_ttl(),
            )
            .await?;

        if let Err(err) = self.broker.delete(&self.config.retry_key(record.task_id)).await {
            // the record still expires on its own
            tracing::warn!(task_id = %record.task_id, error = %err, "could not drop retry record");
        }
        Ok(())
    }

    /// Record that a dispatched task finished successfully.
    pub async fn complete_task(&self, dispatched: &DispatchedTask) -> Result<(), EngineError> {
        let task_id = dispatched.task_id();
        if let Err(err) = self
            .broker
            .mark_finished(&dispatched.queue, &dispatched.job.id)
            .await
        {
            tracing::error!(op = "complete_task", %task_id, job_id = %dispatched.job.id, error = %err, "could not mark job finished");
            return Err(err.into());
        }

        if dispatched.job.meta.retry_count > 0
            && let Err(err) = self.broker.delete(&self.config.retry_key(task_id)).await
        {
            tracing::warn!(%task_id, error = %err, "could not drop retry record");
        }
        tracing::debug!(%task_id, job_id = %dispatched.job.id, tier = %dispatched.tier, "task completed");
        Ok(())
    }

    /// Dead-letter records, newest failure first, at most `limit`.
    pub async fn get_failed_jobs(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, EngineError> {
        let result = self.load_dead_letters().await;
        match result {
            Ok(mut records) => {
                records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
                records.truncate(limit);
                Ok(records)
            }
            Err(err) => {
                tracing::error!(op = "get_failed_jobs", error = %err, "could not list dead letters");
                Err(err)
            }
        }
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, EngineError> {
        let keys = self.broker.keys(&self.config.dead_letter_key_prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.broker.get(&key).await? else {
                continue;
            };
            match self.serializer.decode_record::<DeadLetterRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(%key, error = %err, "skipping undecodable dead letter"),
            }
        }
        Ok(records)
    }

    /// Resubmit a dead-lettered task to its original tier with a fresh
    /// retry budget under a new job id, then drop the dead-letter record.
    pub async fn retry_failed_job(&self, task_id: TaskId) -> Result<JobId, EngineError> {
        let result = self.try_resurrect(task_id).await;
        match &result {
            Ok(job_id) => tracing::info!(%task_id, %job_id, "dead letter resubmitted"),
            Err(err) => {
                tracing::error!(op = "retry_failed_job", %task_id, error = %err, "resubmission failed");
            }
        }
        result
    }

    async fn try_resurrect(&self, task_id: TaskId) -> Result<JobId, EngineError> {
        let key = self.config.dead_letter_key(task_id);
        let bytes = self
            .broker
            .get(&key)
            .await?
            .ok_or(EngineError::DeadLetterNotFound(task_id))?;
        let record: DeadLetterRecord = self.serializer.decode_record(&bytes)?;

        let task = Task::try_from(record.task)?.reset_retries();
        let job_id = self
            .try_enqueue(
                &task,
                record.original_priority,
                None,
                JobId::for_resubmission(task_id),
            )
            .await?;

        if let Err(err) = self.broker.delete(&key).await {
            // the task is queued again; a stale record only lingers until its ttl
            tracing::warn!(%task_id, %job_id, error = %err, "could not drop dead-letter record");
        }
        Ok(job_id)
    }

    /// Per-tier counts, totals and round-robin counters.
    ///
    /// A tier that cannot be queried carries an error marker instead of
    /// counts; the other tiers are still collected.
    pub async fn get_queue_statistics(&self) -> QueueStatistics {
        let mut stats = QueueStatistics {
            round_robin: self.round_robin.snapshot(),
            collected_at: Some(self.clock.now()),
            ..Default::default()
        };

        for (tier, queue) in self.topology.iter() {
            let tier_stats = match self.broker.counts(queue).await {
                Ok(counts) => {
                    let mut tier_stats = TierStatistics::ok(queue, counts);
                    match self.broker.peek(queue).await {
                        Ok(head) => tier_stats.oldest_enqueued_at = head.map(|j| j.enqueued_at),
                        Err(err) => tier_stats.error = Some(err.to_string()),
                    }
                    tier_stats
                }
                Err(err) => {
                    tracing::warn!(op = "get_queue_statistics", %tier, queue, error = %err, "tier counts unavailable");
                    TierStatistics::failed(queue, err)
                }
            };
            stats.record(tier, tier_stats);
        }

        match self.broker.keys(&self.config.dead_letter_key_prefix).await {
            Ok(keys) => stats.dead_lettered = Some(keys.len()),
            Err(err) => {
                tracing::warn!(op = "get_queue_statistics", error = %err, "dead-letter count unavailable");
            }
        }
        stats
    }

    /// Delete retry records whose `next_retry_time` is more than
    /// `older_than_hours` in the past, plus any record that cannot be
    /// decoded. Returns how many were deleted.
    pub async fn cleanup_old_retry_info(&self, older_than_hours: u64) -> Result<usize, EngineError> {
        let result = self.sweep_retry_records(older_than_hours).await;
        match &result {
            Ok(deleted) => tracing::info!(deleted, older_than_hours, "retry ledger swept"),
            Err(err) => {
                tracing::error!(op = "cleanup_old_retry_info", error = %err, "retry ledger sweep failed");
            }
        }
        result
    }

    async fn sweep_retry_records(&self, older_than_hours: u64) -> Result<usize, EngineError> {
        let cutoff = before(self.clock.now(), older_than_hours);
        let mut deleted = 0;

        for key in self.broker.keys(&self.config.retry_key_prefix).await? {
            let Some(bytes) = self.broker.get(&key).await? else {
                continue;
            };
            let stale = match self.serializer.decode_record::<RetryRecord>(&bytes) {
                Ok(record) => record.next_retry_time < cutoff,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "deleting corrupt retry record");
                    true
                }
            };
            if stale && self.broker.delete(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn load_retry_record(&self, task_id: TaskId) -> Result<Option<RetryRecord>, EngineError> {
        let Some(bytes) = self.broker.get(&self.config.retry_key(task_id)).await? else {
            return Ok(None);
        };
        match self.serializer.decode_record(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // treated as due; the sweep removes it later
                tracing::warn!(%task_id, error = %err, "undecodable retry record");
                Ok(None)
            }
        }
    }
}

fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireFormat;
    use crate::domain::{BrokerError, TaskState};
    use crate::impls::{BrokerOp, InMemoryBroker};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    struct Fixture {
        handler: PriorityQueueHandler,
        broker: Arc<InMemoryBroker>,
        clock: Arc<FixedClock>,
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));
        let handler = PriorityQueueHandler::new(broker.clone(), clock.clone(), config).unwrap();
        Fixture {
            handler,
            broker,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default())
    }

    fn task(priority: PriorityTier) -> Task {
        Task::new(12, 7, priority).with_setting("max_length", json!(500))
    }

    impl Fixture {
        async fn submit(&self, priority: PriorityTier) -> Task {
            let task = task(priority);
            self.handler
                .enqueue_by_priority(&task, priority, None)
                .await
                .unwrap();
            task
        }

        async fn next(&self) -> DispatchedTask {
            match self.handler.get_next_task(&PriorityTier::ALL).await {
                Dequeued::Ready(d) => d,
                other => panic!("expected a task, got {other:?}"),
            }
        }

        async fn total_queued(&self) -> usize {
            let mut total = 0;
            for tier in PriorityTier::ALL {
                total += self.broker.queued_len(tier.as_str()).await;
            }
            total
        }
    }

    #[tokio::test]
    async fn urgent_is_served_before_normal() {
        let f = fixture();
        let normal = f.submit(PriorityTier::Normal).await;
        let urgent = f.submit(PriorityTier::Urgent).await;

        assert_eq!(f.next().await.task_id(), urgent.task_id);
        assert_eq!(f.next().await.task_id(), normal.task_id);
        assert!(matches!(
            f.handler.get_next_task(&PriorityTier::ALL).await,
            Dequeued::Empty
        ));
    }

    #[tokio::test]
    async fn highest_accepted_tier_wins_and_fifo_holds_within_it() {
        let f = fixture();
        f.submit(PriorityTier::Urgent).await;
        let first = f.submit(PriorityTier::Normal).await;
        let second = f.submit(PriorityTier::Normal).await;
        f.submit(PriorityTier::Low).await;

        let accepts = [PriorityTier::Low, PriorityTier::Normal];
        let a = f.handler.get_next_task(&accepts).await.into_ready().unwrap();
        let b = f.handler.get_next_task(&accepts).await.into_ready().unwrap();
        let c = f.handler.get_next_task(&accepts).await.into_ready().unwrap();

        assert_eq!(a.task_id(), first.task_id);
        assert_eq!(b.task_id(), second.task_id);
        assert_eq!(c.tier, PriorityTier::Low);
        assert_eq!(f.broker.queued_len("urgent").await, 1);
    }

    #[tokio::test]
    async fn dispatched_task_round_trips_through_the_queue() {
        let f = fixture_with(EngineConfig {
            wire_format: WireFormat::Json,
            ..Default::default()
        });
        let sent = f.submit(PriorityTier::High).await;
        let got = f.next().await;

        assert_eq!(got.task.task_id, sent.task_id);
        assert_eq!(got.task.owner_id, 12);
        assert_eq!(got.task.resource_id, 7);
        assert_eq!(got.task.settings, sent.settings);
        assert_eq!(got.job.id, JobId::for_task(sent.task_id));
        assert_eq!(got.queue, "high");
    }

    #[tokio::test]
    async fn enqueue_to_unbound_tier_is_tier_not_found() {
        let mut config = EngineConfig::default();
        config.tiers.retain(|b| b.tier != PriorityTier::Low);
        let f = fixture_with(config);

        let err = f
            .handler
            .enqueue_by_priority(&task(PriorityTier::Low), PriorityTier::Low, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TierNotFound(ref t) if t == "low"));
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_task() {
        let f = fixture();
        let mut bad = task(PriorityTier::Normal);
        bad.resource_id = -1;
        let err = f
            .handler
            .enqueue_by_priority(&bad, PriorityTier::Normal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(f.total_queued().await, 0);
    }

    #[tokio::test]
    async fn enqueue_uses_configured_timeout_unless_given() {
        let f = fixture_with(EngineConfig {
            job_timeout_secs: Some(30),
            ..Default::default()
        });
        f.submit(PriorityTier::Normal).await;
        let t = task(PriorityTier::Normal);
        f.handler
            .enqueue_by_priority(&t, PriorityTier::Normal, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(f.next().await.job.timeout, Some(Duration::from_secs(30)));
        assert_eq!(f.next().await.job.timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn broken_tier_is_skipped() {
        let f = fixture();
        f.submit(PriorityTier::Urgent).await;
        let normal = f.submit(PriorityTier::Normal).await;
        f.broker.break_queue("urgent").await;

        assert_eq!(f.next().await.task_id(), normal.task_id);

        match f.handler.get_next_task(&PriorityTier::ALL).await {
            Dequeued::Unavailable(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].is_broker());
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbound_worker_tier_is_reported_without_blocking_others() {
        let mut config = EngineConfig::default();
        config.tiers.retain(|b| b.tier != PriorityTier::Low);
        let f = fixture_with(config);

        match f.handler.get_next_task(&[PriorityTier::Low]).await {
            Dequeued::Unavailable(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], EngineError::TierNotFound(ref t) if t == "low"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }

        let normal = f.submit(PriorityTier::Normal).await;
        let accepts = [PriorityTier::Normal, PriorityTier::Low];
        let got = f.handler.get_next_task(&accepts).await.into_ready().unwrap();
        assert_eq!(got.task_id(), normal.task_id);
    }

    #[tokio::test]
    async fn offline_broker_is_unavailable_not_empty() {
        let f = fixture();
        f.broker.set_offline(true).await;
        match f.handler.get_next_task(&PriorityTier::ALL).await {
            Dequeued::Unavailable(errors) => assert_eq!(errors.len(), 4),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        let err = f
            .handler
            .enqueue_by_priority(&task(PriorityTier::High), PriorityTier::High, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BrokerUnavailable(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped_and_walk_continues() {
        let f = fixture();
        let task_id = TaskId::new();
        let junk = Job::new(
            JobId::for_task(task_id),
            b"\xc1\xc1 not a task".to_vec(),
            JobMeta {
                task_id,
                priority: PriorityTier::Urgent,
                retry_count: 0,
                max_retries: 3,
            },
            f.clock.now(),
        );
        f.broker.push("urgent", junk.clone()).await.unwrap();
        let low = f.submit(PriorityTier::Low).await;

        assert_eq!(f.next().await.task_id(), low.task_id);
        assert_eq!(f.broker.job_state(&junk.id).await, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn failed_job_is_retried_after_backoff() {
        let f = fixture();
        let sent = f.submit(PriorityTier::High).await;
        let running = f.next().await;

        let outcome = f
            .handler
            .requeue_failed_task(
                running.job.clone().failed_with("Traceback\nValueError: boom"),
                &RetryPolicy::default(),
            )
            .await;
        let RequeueOutcome::Retried {
            job_id,
            delay_secs,
            retry_count,
        } = outcome
        else {
            panic!("expected Retried, got {outcome:?}");
        };
        assert_eq!(retry_count, 1);
        assert_eq!(job_id.as_str(), format!("{}_retry_1", sent.task_id));
        // base 2, first failure: raw 2, jittered within [1.6, 2.4]
        assert!((1..=2).contains(&delay_secs));
        assert_eq!(f.broker.job_state(&running.job.id).await, Some(TaskState::Failed));

        let record = f.handler.load_retry_record(sent.task_id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.original_priority, PriorityTier::High);
        assert_eq!(record.failure_reason, "ValueError: boom");

        assert!(matches!(
            f.handler.get_next_task(&PriorityTier::ALL).await,
            Dequeued::Empty
        ));

        f.clock.advance(chrono::Duration::seconds(delay_secs as i64));
        let retried = f.next().await;
        assert_eq!(retried.job.id, job_id);
        assert_eq!(retried.task.retry_count, 1);
        assert_eq!(retried.tier, PriorityTier::High);
    }

    /// Queue a first retry on the urgent tier that is due in 60 seconds.
    async fn push_early_retry(f: &Fixture) -> Task {
        let retrying = task(PriorityTier::Urgent);
        let record = RetryRecord {
            task_id: retrying.task_id,
            retry_count: 1,
            next_retry_time: f.clock.now() + chrono::Duration::seconds(60),
            original_priority: PriorityTier::Urgent,
            failure_reason: "boom".into(),
            policy: RetryPolicy::default(),
        };
        f.broker
            .put(
                &f.handler.config().retry_key(retrying.task_id),
                f.handler.serializer.encode_record(&record).unwrap(),
                Duration::from_secs(86_400),
            )
            .await
            .unwrap();
        let early = Job::new(
            JobId::for_retry(retrying.task_id, 1),
            f.handler.serializer.serialize_task(&retrying).unwrap(),
            JobMeta {
                task_id: retrying.task_id,
                priority: PriorityTier::Urgent,
                retry_count: 1,
                max_retries: 3,
            },
            f.clock.now(),
        );
        f.broker.push("urgent", early).await.unwrap();
        retrying
    }

    #[tokio::test]
    async fn retry_not_yet_due_does_not_block_younger_work() {
        let f = fixture();
        let retrying = push_early_retry(&f).await;
        let fresh = f.submit(PriorityTier::Normal).await;

        assert_eq!(f.next().await.task_id(), fresh.task_id);
        assert_eq!(f.broker.counts("urgent").await.unwrap().deferred, 1);

        f.clock.advance(chrono::Duration::seconds(60));
        let due = f.next().await;
        assert_eq!(due.task_id(), retrying.task_id);
        assert_eq!(due.task.retry_count, 1);
    }

    #[tokio::test]
    async fn unreadable_retry_record_counts_as_due() {
        let f = fixture();
        let sent = f.submit(PriorityTier::High).await;
        let running = f.next().await;
        let RequeueOutcome::Retried { delay_secs, .. } = f
            .handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await
        else {
            panic!("expected a retry");
        };
        f.clock.advance(chrono::Duration::seconds(delay_secs as i64));
        f.broker.fail_op(BrokerOp::Get).await;

        let retried = f.next().await;
        assert_eq!(retried.task_id(), sent.task_id);
        assert_eq!(retried.job.id, JobId::for_retry(sent.task_id, 1));
        assert_eq!(f.total_queued().await, 0);
    }

    #[tokio::test]
    async fn retry_that_cannot_be_deferred_goes_back_on_its_queue() {
        let f = fixture();
        let retrying = push_early_retry(&f).await;
        f.broker.fail_op(BrokerOp::PushDelayed).await;

        assert!(matches!(
            f.handler.get_next_task(&[PriorityTier::Urgent]).await,
            Dequeued::Empty
        ));
        let job_id = JobId::for_retry(retrying.task_id, 1);
        assert_eq!(f.broker.job_state(&job_id).await, Some(TaskState::Queued));
        assert_eq!(f.broker.queued_len("urgent").await, 1);

        f.broker.restore_op(BrokerOp::PushDelayed).await;
        f.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(f.next().await.task_id(), retrying.task_id);
    }

    #[tokio::test]
    async fn retry_that_cannot_be_put_back_is_dispatched_early() {
        let f = fixture();
        let retrying = push_early_retry(&f).await;
        f.broker.fail_op(BrokerOp::PushDelayed).await;
        f.broker.fail_op(BrokerOp::Push).await;

        let early = f.next().await;
        assert_eq!(early.task_id(), retrying.task_id);
        assert_eq!(early.task.retry_count, 1);
    }

    #[tokio::test]
    async fn failed_ttl_refresh_still_defers_the_retry() {
        let f = fixture();
        push_early_retry(&f).await;
        f.broker.fail_op(BrokerOp::Expire).await;

        assert!(matches!(
            f.handler.get_next_task(&PriorityTier::ALL).await,
            Dequeued::Empty
        ));
        assert_eq!(f.broker.counts("urgent").await.unwrap().deferred, 1);
    }

    #[tokio::test]
    async fn unpushable_retry_is_dead_lettered_instead() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Normal).await;
        let running = f.next().await;
        f.broker.fail_op(BrokerOp::PushDelayed).await;

        let outcome = f
            .handler
            .requeue_failed_task(
                running.job.failed_with("ValueError: boom"),
                &RetryPolicy::default(),
            )
            .await;
        assert!(matches!(outcome, RequeueOutcome::DeadLettered));
        assert_eq!(f.total_queued().await, 0);
        assert!(f.broker.keys("retry:").await.unwrap().is_empty());

        let records = f.handler.get_failed_jobs(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, sent.task_id);
        assert_eq!(records[0].final_retry_count, 0);
        assert_eq!(records[0].failure_reason, "ValueError: boom");

        f.broker.restore_op(BrokerOp::PushDelayed).await;
        f.handler.retry_failed_job(sent.task_id).await.unwrap();
        assert_eq!(f.next().await.task_id(), sent.task_id);
    }

    #[tokio::test]
    async fn retry_push_and_dead_letter_both_failing_is_reported() {
        let f = fixture();
        f.submit(PriorityTier::Normal).await;
        let running = f.next().await;
        f.broker.fail_op(BrokerOp::PushDelayed).await;
        f.broker.fail_op(BrokerOp::Put).await;

        let outcome = f
            .handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await;
        assert!(matches!(outcome, RequeueOutcome::Failed(ref e) if e.is_broker()));
        assert!(f.broker.keys("retry:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_without_a_record_is_still_scheduled() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Normal).await;
        let running = f.next().await;
        f.broker.fail_op(BrokerOp::Put).await;

        let RequeueOutcome::Retried { delay_secs, .. } = f
            .handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await
        else {
            panic!("expected a retry");
        };
        assert!(f.broker.keys("retry:").await.unwrap().is_empty());
        assert_eq!(f.broker.counts("normal").await.unwrap().deferred, 1);

        f.clock.advance(chrono::Duration::seconds(delay_secs as i64));
        assert_eq!(f.next().await.task_id(), sent.task_id);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_exactly_once() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Normal).await;
        let mut running = f.next().await;
        running.job.meta.retry_count = 3;
        running.job.meta.max_retries = 3;

        let outcome = f
            .handler
            .requeue_failed_task(
                running.job.clone().failed_with("RuntimeError: nope"),
                &RetryPolicy::default(),
            )
            .await;
        assert!(matches!(outcome, RequeueOutcome::DeadLettered));
        assert!(!outcome.is_retried());

        let keys = f.broker.keys("failed:").await.unwrap();
        assert_eq!(keys, vec![format!("failed:{}", sent.task_id)]);
        assert_eq!(f.total_queued().await, 0);
        assert!(f.broker.keys("retry:").await.unwrap().is_empty());

        let records = f.handler.get_failed_jobs(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].final_retry_count, 3);
        assert_eq!(records[0].failure_reason, "RuntimeError: nope");
        assert_eq!(records[0].original_priority, PriorityTier::Normal);
        assert_eq!(records[0].task.owner_id, 12);
    }

    #[tokio::test]
    async fn dead_lettering_twice_overwrites() {
        let f = fixture();
        f.submit(PriorityTier::Low).await;
        let running = f.next().await;

        f.handler.dead_letter_job(running.job.clone()).await.unwrap();
        f.handler.dead_letter_job(running.job.clone()).await.unwrap();
        assert_eq!(f.broker.keys("failed:").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn always_failing_task_ends_in_dead_letters() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Urgent).await;
        let policy = RetryPolicy::default();

        let mut retries = 0;
        loop {
            let running = f.next().await;
            match f.handler.requeue_failed_task(running.job, &policy).await {
                RequeueOutcome::Retried { delay_secs, .. } => {
                    retries += 1;
                    f.clock.advance(chrono::Duration::seconds(delay_secs as i64));
                }
                RequeueOutcome::DeadLettered => break,
                RequeueOutcome::Failed(err) => panic!("unexpected failure: {err}"),
            }
        }

        assert_eq!(retries, sent.max_retries);
        assert_eq!(f.total_queued().await, 0);
        let records = f.handler.get_failed_jobs(10).await.unwrap();
        assert_eq!(records[0].job_id, JobId::for_retry(sent.task_id, 3));
        assert_eq!(records[0].failure_reason, "unknown error");
    }

    #[tokio::test]
    async fn requeue_with_unbound_tier_fails() {
        let mut config = EngineConfig::default();
        config.tiers.retain(|b| b.tier != PriorityTier::High);
        let f = fixture_with(config);
        let t = task(PriorityTier::High);
        let job = Job::new(
            JobId::for_task(t.task_id),
            f.handler.serializer.serialize_task(&t).unwrap(),
            JobMeta {
                task_id: t.task_id,
                priority: PriorityTier::High,
                retry_count: 0,
                max_retries: 3,
            },
            f.clock.now(),
        );

        let outcome = f
            .handler
            .requeue_failed_task(job, &RetryPolicy::default())
            .await;
        assert!(matches!(outcome, RequeueOutcome::Failed(EngineError::TierNotFound(_))));
    }

    #[tokio::test]
    async fn dead_letter_can_be_resubmitted_with_fresh_budget() {
        let f = fixture();
        let sent = f.submit(PriorityTier::High).await;
        let mut running = f.next().await;
        running.job.meta.retry_count = 3;
        f.handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await;

        let job_id = f.handler.retry_failed_job(sent.task_id).await.unwrap();
        assert_ne!(job_id, JobId::for_task(sent.task_id));
        assert!(f.broker.keys("failed:").await.unwrap().is_empty());

        let back = f.next().await;
        assert_eq!(back.task_id(), sent.task_id);
        assert_eq!(back.job.id, job_id);
        assert_eq!(back.tier, PriorityTier::High);
        assert_eq!(back.task.retry_count, 0);
        assert_eq!(back.job.meta.retry_count, 0);

        let err = f.handler.retry_failed_job(sent.task_id).await.unwrap_err();
        assert!(matches!(err, EngineError::DeadLetterNotFound(id) if id == sent.task_id));

        let outcome = f
            .handler
            .requeue_failed_task(back.job, &RetryPolicy::default())
            .await;
        let RequeueOutcome::Retried { job_id: retry_id, .. } = outcome else {
            panic!("expected Retried, got {outcome:?}");
        };
        assert_eq!(retry_id, job_id.retry(1));
    }

    #[tokio::test]
    async fn resubmission_keeps_the_failed_count() {
        let f = fixture();
        let sent = f.submit(PriorityTier::High).await;
        let mut running = f.next().await;
        running.job.meta.retry_count = 3;
        f.handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await;
        assert_eq!(f.broker.counts("high").await.unwrap().failed, 1);

        f.handler.retry_failed_job(sent.task_id).await.unwrap();
        let counts = f.broker.counts("high").await.unwrap();
        assert_eq!((counts.failed, counts.pending), (1, 1));

        let stats = f.handler.get_queue_statistics().await;
        assert_eq!(stats.totals.failed, 1);
    }

    #[tokio::test]
    async fn enqueuing_the_same_task_twice_is_rejected() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Normal).await;
        let err = f
            .handler
            .enqueue_by_priority(&sent, PriorityTier::Normal, None)
            .await
            .unwrap_err();
        assert!(err.is_broker());
        assert_eq!(f.broker.counts("normal").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_jobs_are_limited_and_newest_first() {
        let f = fixture();
        for _ in 0..3 {
            f.submit(PriorityTier::Normal).await;
            let running = f.next().await;
            f.handler.dead_letter_job(running.job).await.unwrap();
            f.clock.advance(chrono::Duration::seconds(1));
        }
        f.broker
            .put("failed:garbage", b"???".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let records = f.handler.get_failed_jobs(2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].failed_at > records[1].failed_at);
    }

    #[tokio::test]
    async fn completion_is_recorded_and_clears_retry_record() {
        let f = fixture();
        let sent = f.submit(PriorityTier::Normal).await;
        let running = f.next().await;
        let RequeueOutcome::Retried { delay_secs, .. } = f
            .handler
            .requeue_failed_task(running.job, &RetryPolicy::default())
            .await
        else {
            panic!("expected a retry");
        };
        f.clock.advance(chrono::Duration::seconds(delay_secs as i64));

        let retried = f.next().await;
        f.handler.complete_task(&retried).await.unwrap();

        let counts = f.broker.counts("normal").await.unwrap();
        assert_eq!(counts.finished, 1);
        assert_eq!(counts.failed, 1);
        assert!(f.handler.load_retry_record(sent.task_id).await.unwrap().is_none());
        assert!(f.handler.complete_task(&retried).await.is_err());
    }

    #[tokio::test]
    async fn statistics_survive_a_broken_tier() {
        let f = fixture();
        f.submit(PriorityTier::Urgent).await;
        f.submit(PriorityTier::Urgent).await;
        f.submit(PriorityTier::Low).await;
        f.next().await;
        f.broker.break_queue("low").await;

        let stats = f.handler.get_queue_statistics().await;
        let urgent = &stats.tiers[&PriorityTier::Urgent];
        assert_eq!(urgent.counts.unwrap().pending, 1);
        assert_eq!(urgent.counts.unwrap().started, 1);
        assert!(urgent.oldest_enqueued_at.is_some());

        let low = &stats.tiers[&PriorityTier::Low];
        assert!(low.counts.is_none());
        assert!(low.error.as_deref().unwrap().contains("unreachable"));

        assert_eq!(stats.totals.pending, 1);
        assert_eq!(stats.round_robin[&PriorityTier::Urgent], 1);
        assert_eq!(stats.dead_lettered, Some(0));
        assert!(stats.is_partial());
    }

    async fn put_retry_record(f: &Fixture, age_hours: i64) -> TaskId {
        let record = RetryRecord {
            task_id: TaskId::new(),
            retry_count: 1,
            next_retry_time: f.clock.now() - chrono::Duration::hours(age_hours),
            original_priority: PriorityTier::Normal,
            failure_reason: "boom".into(),
            policy: RetryPolicy::default(),
        };
        f.broker
            .put(
                &f.handler.config().retry_key(record.task_id),
                f.handler.serializer.encode_record(&record).unwrap(),
                Duration::from_secs(86_400),
            )
            .await
            .unwrap();
        record.task_id
    }

    #[rstest]
    #[case(WireFormat::MessagePack)]
    #[case(WireFormat::Json)]
    #[tokio::test]
    async fn cleanup_deletes_exactly_the_old_half(#[case] format: WireFormat) {
        let f = fixture_with(EngineConfig {
            wire_format: format,
            ..Default::default()
        });
        let mut old = Vec::new();
        for hours in [25, 30, 48] {
            old.push(put_retry_record(&f, hours).await);
        }
        let mut fresh = Vec::new();
        for hours in [0, 2, 23] {
            fresh.push(put_retry_record(&f, hours).await);
        }

        assert_eq!(f.handler.cleanup_old_retry_info(24).await.unwrap(), 3);
        assert_eq!(f.handler.cleanup_old_retry_info(24).await.unwrap(), 0);

        for id in old {
            assert!(f.handler.load_retry_record(id).await.unwrap().is_none());
        }
        for id in fresh {
            assert!(f.handler.load_retry_record(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn cleanup_removes_corrupt_records() {
        let f = fixture();
        put_retry_record(&f, 1).await;
        f.broker
            .put("retry:corrupt", b"{not: valid".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(f.handler.cleanup_old_retry_info(24).await.unwrap(), 1);
        assert_eq!(f.broker.keys("retry:").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_reports_broker_failure() {
        let f = fixture();
        f.broker.set_offline(true).await;
        assert!(f.handler.cleanup_old_retry_info(24).await.unwrap_err().is_broker());
    }
}
