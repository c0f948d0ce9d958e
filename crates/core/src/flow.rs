//! Task flow ledger
//!
//! The execution record of a workflow: an ordered sequence of task
//! activations, the append-only context store they reference by index, and
//! the staging table of tasks eligible to run next. The ledger is pure data
//! with query helpers; all decisions live in the conductor.

use std::collections::BTreeMap;

use baton_events::{TaskState, ACTIVE_TASK_STATES};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One activation of a task
///
/// Tasks on a cycle produce one entry per re-entry; `TaskFlow::tasks` always
/// points at the latest. The `transitions` map records, per outbound
/// transition id (`"<dst>__<key>"`), whether its criteria evaluated true; it
/// is flattened beside the named fields in the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFlowEntry {
    /// Task id this entry is an activation of
    pub id: String,
    /// Index of the inbound context entry
    pub ctx: usize,
    /// Current task state; set only through the task state machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    /// Outbound criteria results keyed by transition id
    #[serde(flatten)]
    pub transitions: BTreeMap<String, bool>,
}

impl TaskFlowEntry {
    /// Create a fresh activation pointing at an inbound context
    pub fn new(id: impl Into<String>, ctx: usize) -> Self {
        Self {
            id: id.into(),
            ctx,
            state: None,
            transitions: BTreeMap::new(),
        }
    }

    /// Check whether an outbound criterion was recorded as satisfied
    pub fn transition_satisfied(&self, transition_id: &str) -> bool {
        self.transitions.get(transition_id).copied().unwrap_or(false)
    }
}

/// A context entry in the append-only context store
///
/// Non-terminal entries serialize their contributing flow indices under
/// `srcs`; the unique terminal entry serializes them under `src` with
/// `term: true`. The key asymmetry is wire behavior and is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ContextEntryRepr", into = "ContextEntryRepr")]
pub struct ContextEntry {
    /// Flow indices of the entries that contributed this context
    pub sources: Vec<usize>,
    /// The context value
    pub value: Value,
    /// Marks the terminal context entry
    pub term: bool,
}

impl ContextEntry {
    /// Create a non-terminal context entry
    pub fn new(sources: Vec<usize>, value: Value) -> Self {
        Self {
            sources,
            value,
            term: false,
        }
    }

    /// Create the terminal context entry
    pub fn terminal(sources: Vec<usize>, value: Value) -> Self {
        Self {
            sources,
            value,
            term: true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ContextEntryRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srcs: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    term: bool,
    value: Value,
}

impl From<ContextEntryRepr> for ContextEntry {
    fn from(repr: ContextEntryRepr) -> Self {
        Self {
            sources: repr.src.or(repr.srcs).unwrap_or_default(),
            value: repr.value,
            term: repr.term,
        }
    }
}

impl From<ContextEntry> for ContextEntryRepr {
    fn from(entry: ContextEntry) -> Self {
        if entry.term {
            Self {
                srcs: None,
                src: Some(entry.sources),
                term: true,
                value: entry.value,
            }
        } else {
            Self {
                srcs: Some(entry.sources),
                src: None,
                term: false,
                value: entry.value,
            }
        }
    }
}

/// A task marked eligible to run with its inbound contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedTask {
    /// Inbound context indices accumulated from satisfied transitions
    pub ctxs: Vec<usize>,
    /// Whether the inbound join barrier is satisfied
    pub ready: bool,
}

/// The execution ledger for one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFlow {
    /// Latest activation index per task id
    pub tasks: BTreeMap<String, usize>,
    /// Ordered task activations
    pub sequence: Vec<TaskFlowEntry>,
    /// Append-only context store
    pub contexts: Vec<ContextEntry>,
    /// Tasks eligible to run next
    pub staged: BTreeMap<String, StagedTask>,
}

impl TaskFlow {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries whose state is one of the given states
    pub fn get_tasks_by_state(&self, states: &[TaskState]) -> Vec<&TaskFlowEntry> {
        self.sequence
            .iter()
            .filter(|entry| entry.state.is_some_and(|state| states.contains(&state)))
            .collect()
    }

    /// Check for entries with in-flight work
    pub fn has_active_tasks(&self) -> bool {
        !self.get_tasks_by_state(ACTIVE_TASK_STATES).is_empty()
    }

    /// Check for entries winding down toward a pause
    pub fn has_pausing_tasks(&self) -> bool {
        !self.get_tasks_by_state(&[TaskState::Pausing]).is_empty()
    }

    /// Check for paused or parked entries
    pub fn has_paused_tasks(&self) -> bool {
        !self
            .get_tasks_by_state(&[TaskState::Paused, TaskState::Pending])
            .is_empty()
    }

    /// Check for entries winding down toward a cancel
    pub fn has_canceling_tasks(&self) -> bool {
        !self.get_tasks_by_state(&[TaskState::Canceling]).is_empty()
    }

    /// Check for canceled entries
    pub fn has_canceled_tasks(&self) -> bool {
        !self.get_tasks_by_state(&[TaskState::Canceled]).is_empty()
    }

    /// Staged task ids whose join barrier is satisfied
    pub fn get_staged_tasks(&self) -> Vec<&str> {
        self.staged
            .iter()
            .filter(|(_, staged)| staged.ready)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Check for staged tasks that are ready to run
    pub fn has_staged_tasks(&self) -> bool {
        self.staged.values().any(|staged| staged.ready)
    }

    /// Latest activation of a task, if any
    pub fn get_task_entry(&self, task_id: &str) -> Option<&TaskFlowEntry> {
        self.tasks
            .get(task_id)
            .and_then(|idx| self.sequence.get(*idx))
    }

    /// Append a fresh activation and point `tasks` at it
    pub fn add_task_entry(&mut self, task_id: &str, ctx: usize) -> usize {
        self.sequence.push(TaskFlowEntry::new(task_id, ctx));
        let idx = self.sequence.len() - 1;
        self.tasks.insert(task_id.to_string(), idx);
        idx
    }

    /// Serialize to the wire form
    pub fn serialize(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuild from the wire form
    pub fn deserialize(data: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(data.clone())
    }
}
