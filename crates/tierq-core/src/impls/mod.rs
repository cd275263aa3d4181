//! Port implementations that live in this crate.
//!
//! Only the in-memory broker ships here; adapters for a networked store
//! implement [`Broker`](crate::ports::Broker) in their own crates.

pub mod memory_broker;

pub use self::memory_broker::{BrokerOp, InMemoryBroker};
