//! Event type definitions for the conductor
//!
//! The conductor is a pure decision engine: it never runs actions itself.
//! The external executor reports action progress through these events and
//! harvests the next batch of tasks in return.

use serde::{Deserialize, Serialize};

use crate::state::{TaskState, WorkflowState};

/// The kind of action progress an execution event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    /// Action was handed to the executor
    ActionScheduled,
    /// Action started executing
    ActionStarted,
    /// Action is parked awaiting an external condition
    ActionPending,
    /// Pause was requested for the action
    ActionPausing,
    /// Action is paused
    ActionPaused,
    /// Cancel was requested for the action
    ActionCanceling,
    /// Action was canceled
    ActionCanceled,
    /// Action completed successfully
    ActionSucceeded,
    /// Action failed
    ActionFailed,
    /// Reserved `noop` task completing silently
    Noop,
    /// Reserved `fail` task completing as a failure
    Fail,
}

impl ExecutionEventKind {
    /// The task state this event drives the task toward
    pub fn task_state(&self) -> TaskState {
        match self {
            ExecutionEventKind::ActionScheduled => TaskState::Scheduled,
            ExecutionEventKind::ActionStarted => TaskState::Running,
            ExecutionEventKind::ActionPending => TaskState::Pending,
            ExecutionEventKind::ActionPausing => TaskState::Pausing,
            ExecutionEventKind::ActionPaused => TaskState::Paused,
            ExecutionEventKind::ActionCanceling => TaskState::Canceling,
            ExecutionEventKind::ActionCanceled => TaskState::Canceled,
            ExecutionEventKind::ActionSucceeded => TaskState::Succeeded,
            ExecutionEventKind::ActionFailed => TaskState::Failed,
            ExecutionEventKind::Noop => TaskState::Succeeded,
            ExecutionEventKind::Fail => TaskState::Failed,
        }
    }
}

impl std::fmt::Display for ExecutionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionEventKind::ActionScheduled => "action_scheduled",
            ExecutionEventKind::ActionStarted => "action_started",
            ExecutionEventKind::ActionPending => "action_pending",
            ExecutionEventKind::ActionPausing => "action_pausing",
            ExecutionEventKind::ActionPaused => "action_paused",
            ExecutionEventKind::ActionCanceling => "action_canceling",
            ExecutionEventKind::ActionCanceled => "action_canceled",
            ExecutionEventKind::ActionSucceeded => "action_succeeded",
            ExecutionEventKind::ActionFailed => "action_failed",
            ExecutionEventKind::Noop => "task_noop",
            ExecutionEventKind::Fail => "task_fail",
        };
        write!(f, "{name}")
    }
}

/// An action progress report from the executor for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// What happened to the action
    pub kind: ExecutionEventKind,
    /// Action result payload, if the event carries one
    pub result: Option<serde_json::Value>,
}

impl ExecutionEvent {
    /// Create an event without a result payload
    pub fn new(kind: ExecutionEventKind) -> Self {
        Self { kind, result: None }
    }

    /// Create an event carrying a result payload
    pub fn with_result(kind: ExecutionEventKind, result: serde_json::Value) -> Self {
        Self {
            kind,
            result: Some(result),
        }
    }

    /// Action started executing
    pub fn started() -> Self {
        Self::new(ExecutionEventKind::ActionStarted)
    }

    /// Action completed successfully with a result
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self::with_result(ExecutionEventKind::ActionSucceeded, result)
    }

    /// Action failed with an error result
    pub fn failed(result: serde_json::Value) -> Self {
        Self::with_result(ExecutionEventKind::ActionFailed, result)
    }

    /// Action was canceled
    pub fn canceled() -> Self {
        Self::new(ExecutionEventKind::ActionCanceled)
    }

    /// Reserved `noop` task completing silently
    pub fn noop() -> Self {
        Self::new(ExecutionEventKind::Noop)
    }

    /// Reserved `fail` task completing as a failure
    pub fn fail() -> Self {
        Self::new(ExecutionEventKind::Fail)
    }

    /// The task state this event drives the task toward
    pub fn task_state(&self) -> TaskState {
        self.kind.task_state()
    }
}

/// A direct request to move the workflow to a desired state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionEvent {
    /// The requested workflow state
    pub state: WorkflowState,
}

impl WorkflowExecutionEvent {
    /// Request the given workflow state
    pub fn new(state: WorkflowState) -> Self {
        Self { state }
    }
}

/// A task state change that may imply a workflow state change
///
/// Produced by the conductor after the task state machine has processed an
/// execution event; consumed by the workflow state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionEvent {
    /// The task whose state changed
    pub task_id: String,
    /// The event kind that drove the change
    pub kind: ExecutionEventKind,
    /// The task state after the change
    pub state: TaskState,
}

impl TaskExecutionEvent {
    /// Record a task state change
    pub fn new(task_id: impl Into<String>, kind: ExecutionEventKind, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            state,
        }
    }
}
