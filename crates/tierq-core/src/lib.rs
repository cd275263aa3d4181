//! tierq-core
//!
//! Priority-tiered task distribution over a shared broker.
//!
//! # Modules
//! - **domain**: tiers, ids, tasks, wire envelopes, ledger records, state machine, errors
//! - **ports**: the injected seams (`Broker`, `Clock`)
//! - **impls**: `InMemoryBroker` for development and tests
//! - **codec**: `TaskSerializer` (MessagePack or JSON) and task validation
//! - **queue**: backoff policy and the `PriorityQueueHandler`
//! - **app**: configuration, worker loops, retry sweeper

pub mod app;
pub mod codec;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::EngineConfig;
pub use domain::{EngineError, PriorityTier, Task, TaskId};
pub use queue::{Dequeued, PriorityQueueHandler, RequeueOutcome};
