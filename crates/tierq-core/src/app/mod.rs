//! App layer: configuration and the loops that drive the handler.
//!
//! - **config**: `EngineConfig` and the immutable `QueueTopology`
//! - **worker_loop**: `WorkerLoop` / `WorkerGroup` (poll, execute, report)
//! - **sweeper**: `RetrySweeper` (periodic retry ledger cleanup)

pub mod config;
pub mod sweeper;
pub mod worker_loop;

pub use self::config::{ConfigError, EngineConfig, QueueTopology, TierBinding};
pub use self::sweeper::RetrySweeper;
pub use self::worker_loop::{Step, TaskExecutor, WorkerGroup, WorkerLoop, WorkerSettings};
