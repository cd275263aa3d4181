//! Domain model: tiers, ids, tasks, wire envelopes, ledger records,
//! the task state machine and the error taxonomy.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod records;
pub mod state;
pub mod task;
pub mod tier;

pub use envelope::{SCHEMA_VERSION, SerializationEnvelope, TaskEnvelope};
pub use errors::{BrokerError, CodecError, EngineError};
pub use ids::{JobId, TaskId};
pub use records::{DeadLetterRecord, RetryRecord};
pub use state::TaskState;
pub use task::{DEFAULT_MAX_RETRIES, Task};
pub use tier::{PriorityTier, UnknownTier};
