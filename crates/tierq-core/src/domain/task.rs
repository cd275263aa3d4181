use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{PriorityTier, TaskId};

/// Retry budget a task gets when nothing else is said.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of work as the rest of the application sees it (the record a
/// database row is turned into before it is handed to the queue).
///
/// `owner_id` and `resource_id` point at external entities and must be
/// positive; the serializer refuses tasks where they are not.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub owner_id: i64,
    pub resource_id: i64,
    pub priority: PriorityTier,
    /// Opaque structured payload, passed through untouched.
    pub settings: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Prior failures of this task.
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(owner_id: i64, resource_id: i64, priority: PriorityTier) -> Self {
        Self {
            task_id: TaskId::new(),
            owner_id,
            resource_id,
            priority,
            settings: Map::new(),
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_settings(mut self, settings: Map<String, Value>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    /// No retries left: the next failure dead-letters the task.
    pub fn retry_budget_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Same task, fresh retry budget. Used for manual resubmission.
    pub fn reset_retries(mut self) -> Self {
        self.retry_count = 0;
        self
    }
}
