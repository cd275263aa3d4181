//! Error types.
//!
//! Serializer calls return [`CodecError`] so callers can tell a malformed
//! task from an encoding failure. Broker adapters return [`BrokerError`].
//! Handler operations report [`EngineError`] inside their outcome types.

use thiserror::Error;

use super::{PriorityTier, TaskId};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed or missing required task fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Encode/decode failure; the underlying cause is kept as the source.
    #[error("serialization failed while {context}")]
    Serialization {
        context: &'static str,
        #[source]
        source: BoxError,
    },
}

impl CodecError {
    pub fn serialization(
        context: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        CodecError::Serialization {
            context,
            source: source.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CodecError::Validation(_))
    }
}

/// Failure talking to the shared queue store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Connectivity failure; the store could not be reached at all.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the operation was rejected.
    #[error("broker operation failed: {0}")]
    Operation(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Serialization(CodecError),

    #[error(transparent)]
    BrokerUnavailable(#[from] BrokerError),

    /// An operation referenced a tier with no configured queue.
    #[error("no queue configured for tier '{0}'")]
    TierNotFound(String),

    /// Signals the dead-letter transition rather than a real failure.
    #[error("task {task_id} exhausted its retry budget ({retry_count}/{max_retries})")]
    RetryBudgetExceeded {
        task_id: TaskId,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("no dead-letter record for task {0}")]
    DeadLetterNotFound(TaskId),
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Validation(msg) => EngineError::Validation(msg),
            other => EngineError::Serialization(other),
        }
    }
}

impl EngineError {
    pub fn tier_not_found(tier: PriorityTier) -> Self {
        EngineError::TierNotFound(tier.to_string())
    }

    /// True when the broker itself was the problem (worth retrying later).
    pub fn is_broker(&self) -> bool {
        matches!(self, EngineError::BrokerUnavailable(_))
    }
}
