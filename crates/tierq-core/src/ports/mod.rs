//! Ports: the seams to the outside world.
//!
//! The broker and the clock are injected so tests can swap in
//! `InMemoryBroker` and `FixedClock` without a network dependency.

pub mod broker;
pub mod clock;

pub use self::broker::{Broker, Job, JobMeta, QueueCounts};
pub use self::clock::{Clock, FixedClock, SystemClock};
