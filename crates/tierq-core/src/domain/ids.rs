//! Identifiers.
//!
//! A task keeps one `TaskId` for its whole life (first run, retries,
//! manual resubmission). Every submission to the broker gets its own
//! `JobId`: the first submission reuses the task id, a manual
//! resubmission is tagged `<task_id>_resubmit_<uuid>`, and retries append
//! `_retry_<n>` to the id of the submission they descend from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identity of a task. Immutable once created.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random (v4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // hyphenated lowercase, the same shape the validator accepts
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Handle of one submission on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Id of the first submission of a task.
    pub fn for_task(task_id: TaskId) -> Self {
        Self(task_id.to_string())
    }

    /// Id of the `n`-th retry of a task's first submission.
    pub fn for_retry(task_id: TaskId, n: u32) -> Self {
        Self::for_task(task_id).retry(n)
    }

    /// Fresh id for a manual resubmission of a task.
    pub fn for_resubmission(task_id: TaskId) -> Self {
        Self(format!("{task_id}_resubmit_{}", Uuid::new_v4().simple()))
    }

    /// Id of the `n`-th retry of the submission this job belongs to.
    pub fn retry(&self, n: u32) -> Self {
        Self(format!("{}_retry_{n}", self.submission()))
    }

    /// This id without its `_retry_<n>` suffix, if any.
    pub fn submission(&self) -> &str {
        match self.0.rsplit_once("_retry_") {
            Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
            _ => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
