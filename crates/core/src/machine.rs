//! Task and workflow state machines
//!
//! Both machines are transition tables, not class hierarchies: the task
//! machine maps `(current state, event kind)` pairs to the next task state,
//! and the workflow machine maps `(current state, requested state)` pairs
//! plus derived task-completion events to the next workflow state. States
//! are only ever mutated through these processors.

use baton_events::{
    ExecutionEvent, ExecutionEventKind, StateError, TaskExecutionEvent, TaskState,
    WorkflowExecutionEvent, WorkflowState,
};

use crate::flow::{TaskFlow, TaskFlowEntry};

/// The per-task state machine
pub struct TaskStateMachine;

/// Valid `(current, event kind) -> next` task transitions
///
/// `None` is the state of a freshly staged activation that has no recorded
/// state yet.
const TASK_TRANSITIONS: &[(Option<TaskState>, ExecutionEventKind, TaskState)] = &[
    // Fresh activation
    (None, ExecutionEventKind::ActionScheduled, TaskState::Scheduled),
    (None, ExecutionEventKind::ActionStarted, TaskState::Running),
    (None, ExecutionEventKind::Noop, TaskState::Succeeded),
    (None, ExecutionEventKind::Fail, TaskState::Failed),
    // Requested
    (Some(TaskState::Requested), ExecutionEventKind::ActionScheduled, TaskState::Scheduled),
    (Some(TaskState::Requested), ExecutionEventKind::ActionStarted, TaskState::Running),
    (Some(TaskState::Requested), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Requested), ExecutionEventKind::ActionFailed, TaskState::Failed),
    // Scheduled
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionStarted, TaskState::Running),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionPending, TaskState::Pending),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionPausing, TaskState::Pausing),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionPaused, TaskState::Paused),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionCanceling, TaskState::Canceling),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Scheduled), ExecutionEventKind::ActionFailed, TaskState::Failed),
    // Running
    (Some(TaskState::Running), ExecutionEventKind::ActionPending, TaskState::Pending),
    (Some(TaskState::Running), ExecutionEventKind::ActionPausing, TaskState::Pausing),
    (Some(TaskState::Running), ExecutionEventKind::ActionPaused, TaskState::Paused),
    (Some(TaskState::Running), ExecutionEventKind::ActionCanceling, TaskState::Canceling),
    (Some(TaskState::Running), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Running), ExecutionEventKind::ActionSucceeded, TaskState::Succeeded),
    (Some(TaskState::Running), ExecutionEventKind::ActionFailed, TaskState::Failed),
    // Pending
    (Some(TaskState::Pending), ExecutionEventKind::ActionStarted, TaskState::Running),
    (Some(TaskState::Pending), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Pending), ExecutionEventKind::ActionFailed, TaskState::Failed),
    // Pausing: the action may still finish before the pause lands
    (Some(TaskState::Pausing), ExecutionEventKind::ActionPaused, TaskState::Paused),
    (Some(TaskState::Pausing), ExecutionEventKind::ActionSucceeded, TaskState::Succeeded),
    (Some(TaskState::Pausing), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Pausing), ExecutionEventKind::ActionFailed, TaskState::Failed),
    // Paused
    (Some(TaskState::Paused), ExecutionEventKind::ActionStarted, TaskState::Running),
    (Some(TaskState::Paused), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    // Canceling: the action may still finish before the cancel lands
    (Some(TaskState::Canceling), ExecutionEventKind::ActionCanceled, TaskState::Canceled),
    (Some(TaskState::Canceling), ExecutionEventKind::ActionSucceeded, TaskState::Succeeded),
    (Some(TaskState::Canceling), ExecutionEventKind::ActionFailed, TaskState::Failed),
];

impl TaskStateMachine {
    /// Look up the next state for an event against a current state
    pub fn next_state(current: Option<TaskState>, kind: ExecutionEventKind) -> Option<TaskState> {
        TASK_TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == current && *on == kind)
            .map(|(_, _, to)| *to)
    }

    /// Check whether an event is legal against a current state
    pub fn is_transition_valid(current: Option<TaskState>, kind: ExecutionEventKind) -> bool {
        Self::next_state(current, kind).is_some()
    }

    /// Process an execution event against a task flow entry
    pub fn process_event(
        entry: &mut TaskFlowEntry,
        event: &ExecutionEvent,
    ) -> Result<TaskState, StateError> {
        let next = Self::next_state(entry.state, event.kind).ok_or_else(|| {
            StateError::InvalidTaskStateTransition {
                from: entry.state,
                event: event.kind.to_string(),
            }
        })?;

        entry.state = Some(next);
        Ok(next)
    }
}

/// The per-workflow state machine
pub struct WorkflowStateMachine;

/// Valid `(current, requested) -> requested` workflow transitions
const WORKFLOW_TRANSITIONS: &[(WorkflowState, WorkflowState)] = &[
    (WorkflowState::Unset, WorkflowState::Requested),
    (WorkflowState::Unset, WorkflowState::Running),
    (WorkflowState::Unset, WorkflowState::Canceled),
    (WorkflowState::Unset, WorkflowState::Failed),
    (WorkflowState::Requested, WorkflowState::Running),
    (WorkflowState::Requested, WorkflowState::Pausing),
    (WorkflowState::Requested, WorkflowState::Paused),
    (WorkflowState::Requested, WorkflowState::Canceling),
    (WorkflowState::Requested, WorkflowState::Canceled),
    (WorkflowState::Requested, WorkflowState::Failed),
    (WorkflowState::Running, WorkflowState::Pausing),
    (WorkflowState::Running, WorkflowState::Paused),
    (WorkflowState::Running, WorkflowState::Canceling),
    (WorkflowState::Running, WorkflowState::Canceled),
    (WorkflowState::Running, WorkflowState::Succeeded),
    (WorkflowState::Running, WorkflowState::Failed),
    (WorkflowState::Pausing, WorkflowState::Paused),
    (WorkflowState::Pausing, WorkflowState::Running),
    (WorkflowState::Pausing, WorkflowState::Canceling),
    (WorkflowState::Pausing, WorkflowState::Canceled),
    (WorkflowState::Pausing, WorkflowState::Failed),
    (WorkflowState::Paused, WorkflowState::Resuming),
    (WorkflowState::Paused, WorkflowState::Running),
    (WorkflowState::Paused, WorkflowState::Canceling),
    (WorkflowState::Paused, WorkflowState::Canceled),
    (WorkflowState::Paused, WorkflowState::Failed),
    (WorkflowState::Resuming, WorkflowState::Running),
    (WorkflowState::Resuming, WorkflowState::Pausing),
    (WorkflowState::Resuming, WorkflowState::Canceling),
    (WorkflowState::Resuming, WorkflowState::Canceled),
    (WorkflowState::Resuming, WorkflowState::Failed),
    (WorkflowState::Canceling, WorkflowState::Canceled),
    (WorkflowState::Canceling, WorkflowState::Failed),
    // Output rendering can still fail a workflow that just succeeded.
    (WorkflowState::Succeeded, WorkflowState::Failed),
];

impl WorkflowStateMachine {
    /// Check whether a direct state change is legal
    pub fn is_transition_valid(from: WorkflowState, to: WorkflowState) -> bool {
        from == to || WORKFLOW_TRANSITIONS.contains(&(from, to))
    }

    /// Process a direct workflow state request
    ///
    /// Returns the new state, or `None` when the machine declines the
    /// request. The conductor turns a declined change into an
    /// invalid-workflow-state-transition error.
    pub fn process_workflow_event(
        current: WorkflowState,
        event: &WorkflowExecutionEvent,
    ) -> Option<WorkflowState> {
        if event.state != current && WORKFLOW_TRANSITIONS.contains(&(current, event.state)) {
            Some(event.state)
        } else {
            None
        }
    }

    /// Derive the workflow state implied by a task state change
    ///
    /// Returns `None` when the task event does not move the workflow. The
    /// flow is consulted for remaining work: a success only completes the
    /// workflow once no activations are in flight and nothing is staged. A
    /// failure abends the workflow immediately unless the failing task has
    /// follow-on transitions (`task_has_next`) that handle it.
    pub fn process_task_event(
        current: WorkflowState,
        flow: &TaskFlow,
        event: &TaskExecutionEvent,
        task_has_next: bool,
    ) -> Option<WorkflowState> {
        // A completed workflow is final; late task events cannot move it.
        if current.is_completed() {
            return None;
        }

        // The reserved fail task aborts the workflow outright.
        if event.kind == ExecutionEventKind::Fail {
            return Some(WorkflowState::Failed);
        }

        match event.state {
            TaskState::Running => match current {
                WorkflowState::Requested | WorkflowState::Resuming => Some(WorkflowState::Running),
                _ => None,
            },
            TaskState::Failed => {
                if task_has_next {
                    None
                } else {
                    Some(WorkflowState::Failed)
                }
            }
            TaskState::Succeeded | TaskState::Canceled => Self::on_task_completed(current, flow),
            TaskState::Paused | TaskState::Pending => {
                let quiesced = !flow.has_active_tasks() && !flow.has_pausing_tasks();
                match current {
                    WorkflowState::Running | WorkflowState::Pausing if quiesced => {
                        Some(WorkflowState::Paused)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn on_task_completed(current: WorkflowState, flow: &TaskFlow) -> Option<WorkflowState> {
        if flow.has_active_tasks() {
            // A cancellation starts winding the rest of the workflow down.
            if flow.has_canceled_tasks() || flow.has_canceling_tasks() {
                return match current {
                    WorkflowState::Requested | WorkflowState::Running => {
                        Some(WorkflowState::Canceling)
                    }
                    _ => None,
                };
            }
            return None;
        }

        if current == WorkflowState::Canceling || flow.has_canceled_tasks() {
            return Some(WorkflowState::Canceled);
        }

        if current == WorkflowState::Pausing {
            return Some(WorkflowState::Paused);
        }

        if !current.is_running() || flow.has_staged_tasks() {
            return None;
        }

        Some(WorkflowState::Succeeded)
    }
}
