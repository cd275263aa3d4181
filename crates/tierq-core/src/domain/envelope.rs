//! Wire representation of tasks and the versioned wrapper put around
//! everything persisted on the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::CodecError;
use super::task::DEFAULT_MAX_RETRIES;
use super::{PriorityTier, Task, TaskId};

/// The only schema version this build writes.
pub const SCHEMA_VERSION: &str = "1.0";

/// Field data of a task as it travels on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub owner_id: i64,
    pub resource_id: i64,
    #[serde(default)]
    pub priority: Option<PriorityTier>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl From<&Task> for TaskEnvelope {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.to_string(),
            owner_id: task.owner_id,
            resource_id: task.resource_id,
            priority: Some(task.priority),
            settings: task.settings.clone(),
            created_at: Some(task.created_at),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        }
    }
}

impl TryFrom<TaskEnvelope> for Task {
    type Error = CodecError;

    fn try_from(envelope: TaskEnvelope) -> Result<Self, Self::Error> {
        let task_id: TaskId = envelope.task_id.parse().map_err(|_| {
            CodecError::Validation(format!("task_id '{}' is not a UUID", envelope.task_id))
        })?;

        Ok(Task {
            task_id,
            owner_id: envelope.owner_id,
            resource_id: envelope.resource_id,
            priority: envelope.priority.unwrap_or_default(),
            settings: envelope.settings,
            created_at: envelope.created_at.unwrap_or_else(Utc::now),
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
        })
    }
}

/// Outer wrapper: `{version, timestamp, data}`.
///
/// Created fresh on every encode; it has no lifecycle of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializationEnvelope<T> {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> SerializationEnvelope<T> {
    /// Wrap `data` with the current schema version, stamped now.
    pub fn wrap(data: T) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.version == SCHEMA_VERSION
    }

    pub fn into_data(self) -> T {
        self.data
    }
}
