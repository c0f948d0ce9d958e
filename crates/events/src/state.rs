//! Task and workflow execution states
//!
//! States are only ever mutated through the state machines in the core
//! crate; this module defines the vocabulary and the group predicates the
//! conductor consults when making scheduling decisions.

use serde::{Deserialize, Serialize};

/// Per-task execution states
///
/// ```text
/// Task State Machine (happy path):
///
///     ┌───────────┐    schedule    ┌───────────┐
///     │ Requested │ ──────────────►│ Scheduled │
///     └───────────┘                └─────┬─────┘
///                                        │ start
///                                        ▼
///     ┌───────────┐    success     ┌───────────┐
///     │ Succeeded │◄───────────────│  Running  │
///     └───────────┘                └─────┬─────┘
///                                        │ failure
///                                        ▼
///                                  ┌───────────┐
///                                  │  Failed   │
///                                  └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Execution has been requested but not yet scheduled
    Requested,
    /// Task has been handed to the executor
    Scheduled,
    /// Task is currently executing
    Running,
    /// Task is parked awaiting an external condition
    Pending,
    /// Pause has been requested; the action is still winding down
    Pausing,
    /// Task is paused
    Paused,
    /// Cancel has been requested; the action is still winding down
    Canceling,
    /// Task was canceled
    Canceled,
    /// Task completed successfully
    Succeeded,
    /// Task execution failed
    Failed,
}

/// Task states that count as in-flight work
pub const ACTIVE_TASK_STATES: &[TaskState] = &[
    TaskState::Requested,
    TaskState::Scheduled,
    TaskState::Running,
];

/// Task states from which no further action events are expected
pub const COMPLETED_TASK_STATES: &[TaskState] = &[
    TaskState::Succeeded,
    TaskState::Failed,
    TaskState::Canceled,
];

impl TaskState {
    /// Check if the task still has in-flight work
    pub fn is_active(&self) -> bool {
        ACTIVE_TASK_STATES.contains(self)
    }

    /// Check if this is a terminal task state
    pub fn is_completed(&self) -> bool {
        COMPLETED_TASK_STATES.contains(self)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Requested => "requested",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Pending => "pending",
            TaskState::Pausing => "pausing",
            TaskState::Paused => "paused",
            TaskState::Canceling => "canceling",
            TaskState::Canceled => "canceled",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Workflow-level execution states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Initial state before any execution request
    Unset,
    /// Execution has been requested
    Requested,
    /// Workflow is actively conducting tasks
    Running,
    /// Pause requested; tasks are winding down
    Pausing,
    /// Workflow is paused
    Paused,
    /// Resume requested after a pause
    Resuming,
    /// Cancel requested; tasks are winding down
    Canceling,
    /// Workflow was canceled
    Canceled,
    /// Workflow completed successfully
    Succeeded,
    /// Workflow failed
    Failed,
}

/// Workflow states in which the conductor hands out tasks
pub const RUNNING_WORKFLOW_STATES: &[WorkflowState] = &[
    WorkflowState::Requested,
    WorkflowState::Running,
    WorkflowState::Resuming,
];

/// Terminal workflow states
pub const COMPLETED_WORKFLOW_STATES: &[WorkflowState] = &[
    WorkflowState::Succeeded,
    WorkflowState::Failed,
    WorkflowState::Canceled,
];

/// Abnormally-ended workflow states
pub const ABENDED_WORKFLOW_STATES: &[WorkflowState] =
    &[WorkflowState::Failed, WorkflowState::Canceled];

impl WorkflowState {
    /// Check if the conductor should hand out tasks in this state
    pub fn is_running(&self) -> bool {
        RUNNING_WORKFLOW_STATES.contains(self)
    }

    /// Check if this is a terminal workflow state
    pub fn is_completed(&self) -> bool {
        COMPLETED_WORKFLOW_STATES.contains(self)
    }

    /// Check if the workflow ended abnormally
    pub fn is_abended(&self) -> bool {
        ABENDED_WORKFLOW_STATES.contains(self)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowState::Unset => "unset",
            WorkflowState::Requested => "requested",
            WorkflowState::Running => "running",
            WorkflowState::Pausing => "pausing",
            WorkflowState::Paused => "paused",
            WorkflowState::Resuming => "resuming",
            WorkflowState::Canceling => "canceling",
            WorkflowState::Canceled => "canceled",
            WorkflowState::Succeeded => "succeeded",
            WorkflowState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// State machine errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid task state transition from {from:?} on event {event}")]
    InvalidTaskStateTransition {
        from: Option<TaskState>,
        event: String,
    },

    #[error("invalid workflow state transition from {from} to {to}")]
    InvalidWorkflowStateTransition {
        from: WorkflowState,
        to: WorkflowState,
    },
}
