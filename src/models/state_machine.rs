// Task status state machine with validation

use super::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task has unmet dependencies: {0:?}")]
    UnmetDependencies(Vec<String>),

    #[error("Task already in terminal state: {0:?}")]
    AlreadyTerminal(TaskStatus),
}

/// Validates if a task can transition from one status to another
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match (from, to) {
        // From Blocked
        (TaskStatus::Blocked, TaskStatus::Pending) => true, // Last dependency completed
        (TaskStatus::Blocked, TaskStatus::Failed) => true,  // Cancelled

        // From Pending
        (TaskStatus::Pending, TaskStatus::InProgress) => true,
        (TaskStatus::Pending, TaskStatus::Failed) => true, // Cancelled

        // From InProgress
        (TaskStatus::InProgress, TaskStatus::Completed) => true,
        (TaskStatus::InProgress, TaskStatus::Failed) => true,
        (TaskStatus::InProgress, TaskStatus::Pending) => true, // Retry after backoff

        // Recovery may re-queue a terminally failed task
        (TaskStatus::Failed, TaskStatus::Pending) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: TaskStatus,
    target: TaskStatus,
) -> Result<TaskStatus, StateTransitionError> {
    if !can_transition(current, target) {
        if current == TaskStatus::Completed {
            return Err(StateTransitionError::AlreadyTerminal(current));
        }
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Completed | TaskStatus::Failed)
}

/// Check if a status indicates active work
pub fn is_active_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::InProgress)
}

/// Check if a status indicates waiting (either for capacity or dependencies)
pub fn is_waiting_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Pending | TaskStatus::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_only_leaves_to_pending_or_failed() {
        assert!(can_transition(TaskStatus::Blocked, TaskStatus::Pending));
        assert!(can_transition(TaskStatus::Blocked, TaskStatus::Failed));
        assert!(!can_transition(TaskStatus::Blocked, TaskStatus::InProgress));
        assert!(!can_transition(TaskStatus::Blocked, TaskStatus::Completed));
    }

    #[test]
    fn test_pending_to_in_progress() {
        let result = transition_state(TaskStatus::Pending, TaskStatus::InProgress);
        assert_eq!(result.unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn test_in_progress_can_retry() {
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::Pending));
    }

    #[test]
    fn test_completed_is_final() {
        let result = transition_state(TaskStatus::Completed, TaskStatus::Pending);
        assert!(matches!(
            result,
            Err(StateTransitionError::AlreadyTerminal(TaskStatus::Completed))
        ));
        assert!(!can_transition(TaskStatus::Completed, TaskStatus::Failed));
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let result = transition_state(TaskStatus::Pending, TaskStatus::Completed);
        assert!(matches!(
            result,
            Err(StateTransitionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_same_state_is_noop() {
        assert!(can_transition(TaskStatus::Blocked, TaskStatus::Blocked));
        assert!(can_transition(TaskStatus::Failed, TaskStatus::Failed));
    }

    #[test]
    fn test_state_classification() {
        assert!(is_terminal_state(TaskStatus::Completed));
        assert!(is_terminal_state(TaskStatus::Failed));
        assert!(!is_terminal_state(TaskStatus::Blocked));
        assert!(is_active_state(TaskStatus::InProgress));
        assert!(is_waiting_state(TaskStatus::Blocked));
        assert!(is_waiting_state(TaskStatus::Pending));
    }
}
