//! Queue module: backoff policy, dispatch by priority tier, retry and
//! dead-letter bookkeeping.

mod handler;
mod retry;
mod round_robin;
mod stats;

pub use handler::{DispatchedTask, Dequeued, PriorityQueueHandler, RequeueOutcome};
pub use retry::{BackoffStrategy, RetryPolicy, backoff_delay, backoff_delay_with};
pub use round_robin::{ROUND_ROBIN_MODULUS, RoundRobinCounters};
pub use stats::{QueueStatistics, TierStatistics};
