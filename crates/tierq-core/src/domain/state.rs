//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of a single task submission.
///
/// Transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> Failed -> Deferred -> Queued (while retries remain)
/// - Queued -> Running -> Failed -> DeadLettered (retry budget spent)
/// - Running -> Deferred (popped before its retry time, pushed back)
/// - DeadLettered -> Queued (manual resubmission only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    /// Queued, but not before a retry time.
    Deferred,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

impl TaskState {
    /// No automatic transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::DeadLettered)
    }

    /// Eligible for a worker right now.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Queued)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Deferred, Queued)
                | (Deferred, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Deferred)
                | (Failed, Deferred)
                | (Failed, DeadLettered)
                | (DeadLettered, Queued)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Queued, TaskState::Running)]
    #[case(TaskState::Running, TaskState::Succeeded)]
    #[case(TaskState::Running, TaskState::Failed)]
    #[case(TaskState::Failed, TaskState::Deferred)]
    #[case(TaskState::Deferred, TaskState::Queued)]
    #[case(TaskState::Failed, TaskState::DeadLettered)]
    #[case(TaskState::DeadLettered, TaskState::Queued)]
    fn allowed_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(TaskState::Succeeded, TaskState::Queued)]
    #[case(TaskState::Succeeded, TaskState::Failed)]
    #[case(TaskState::DeadLettered, TaskState::Running)]
    #[case(TaskState::Queued, TaskState::Succeeded)]
    #[case(TaskState::Failed, TaskState::Running)]
    fn forbidden_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn only_queued_is_runnable() {
        assert!(TaskState::Queued.is_runnable());
        assert!(!TaskState::Deferred.is_runnable());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::DeadLettered.is_terminal());
        assert!(!TaskState::Failed.is_terminal());
    }
}
