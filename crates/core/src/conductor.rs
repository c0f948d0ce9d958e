//! The workflow conductor
//!
//! A conductor ties a spec, its composed graph, the task flow ledger, and
//! the two state machines together into a single-writer decision engine.
//! The external executor drives it: request the running state, harvest the
//! start tasks, report execution events through `update_task_flow`, and
//! harvest the next tasks after each completion.
//!
//! The conductor never runs actions and never blocks; every public
//! operation is synchronous and runs to completion. Evaluation and
//! rendering failures are captured into the error log and fail the
//! workflow through the state machine; argument and shape errors are
//! returned to the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use baton_events::{
    ExecutionEvent, TaskExecutionEvent, WorkflowExecutionEvent, StateError, WorkflowState,
};
use baton_expr::{evaluate, evaluate_string, get_evaluator, is_truthy};

use crate::compose::{get_composer, FAIL_TASK_NAME, NOOP_TASK_NAME};
use crate::context::{merge_values, set_current_task, strip_scoped_keys, FLOW_KEY};
use crate::error::ConductorError;
use crate::flow::{ContextEntry, StagedTask, TaskFlow, TaskFlowEntry};
use crate::graph::{Barrier, WorkflowGraph};
use crate::machine::{TaskStateMachine, WorkflowStateMachine};
use crate::spec::WorkflowSpec;

/// A captured conduction error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error message
    pub message: String,
    /// Task the error occurred on, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Transition the error occurred on, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_transition_id: Option<String>,
}

/// A task spec with its expressions rendered against a concrete context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedTaskSpec {
    /// Rendered action descriptor
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub action: Value,
    /// Rendered action inputs
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
}

/// A task handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Scheduling identity
    pub id: String,
    /// Display name
    pub name: String,
    /// Context the task starts with, current task included
    pub ctx: Value,
    /// Rendered task spec
    pub spec: RenderedTaskSpec,
}

/// The workflow decision engine
///
/// A conductor instance is a single-writer object; multi-threaded hosts
/// must serialize calls to the same instance externally.
pub struct WorkflowConductor {
    spec: WorkflowSpec,
    workflow_state: WorkflowState,
    graph: Option<WorkflowGraph>,
    flow: Option<TaskFlow>,
    parent_ctx: Map<String, Value>,
    inputs: Map<String, Value>,
    outputs: Option<Map<String, Value>>,
    errors: Vec<ErrorEntry>,
}

impl WorkflowConductor {
    /// Create a conductor for a spec with an optional parent context and
    /// caller inputs
    pub fn new(
        spec: WorkflowSpec,
        context: Option<Map<String, Value>>,
        inputs: Option<Map<String, Value>>,
    ) -> Result<Self, ConductorError> {
        if spec.catalog.is_empty() {
            return Err(ConductorError::InvalidArgument(
                "spec catalog must not be empty".to_string(),
            ));
        }

        if spec.tasks.is_empty() {
            return Err(ConductorError::InvalidArgument(
                "spec must declare at least one task".to_string(),
            ));
        }

        Ok(Self {
            spec,
            workflow_state: WorkflowState::Unset,
            graph: None,
            flow: None,
            parent_ctx: context.unwrap_or_default(),
            inputs: inputs.unwrap_or_default(),
            outputs: None,
            errors: Vec::new(),
        })
    }

    /// The workflow spec this conductor was built from
    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    // ========================================================================
    // Lazy composition and flow initialization
    // ========================================================================

    fn ensure_graph(&mut self) -> Result<(), ConductorError> {
        if self.graph.is_none() {
            let composer = get_composer(&self.spec.catalog)?;
            self.graph = Some(composer.compose(&self.spec)?);
        }
        Ok(())
    }

    /// Initialize the flow: render inputs and vars, seed the initial
    /// context, and stage the graph roots
    fn ensure_flow(&mut self) -> Result<(), ConductorError> {
        if self.flow.is_some() {
            return Ok(());
        }

        self.ensure_graph()?;
        self.flow = Some(TaskFlow::new());

        let (rendered_inputs, input_errors) = self.spec.render_input(&self.inputs);
        let (rendered_vars, var_errors) = self.spec.render_vars(&rendered_inputs);

        let errors: Vec<String> = input_errors.into_iter().chain(var_errors).collect();
        if !errors.is_empty() {
            self.log_errors(errors, None, None);
            self.request_workflow_state(WorkflowState::Failed)?;
        }

        if !self.workflow_state.is_abended() {
            let mut init = rendered_inputs;
            init.extend(rendered_vars);

            // The parent context wins over rendered inputs and vars.
            let init_ctx = merge_values(
                Value::Object(init),
                Value::Object(self.parent_ctx.clone()),
            );

            let root_ids: Vec<String> = self
                .graph_ref()?
                .roots()
                .iter()
                .map(|node| node.id.clone())
                .collect();

            let flow = self.flow_mut()?;
            flow.contexts.push(ContextEntry::new(Vec::new(), init_ctx));
            for root_id in root_ids {
                flow.staged.insert(
                    root_id,
                    StagedTask {
                        ctxs: vec![0],
                        ready: true,
                    },
                );
            }
        }

        Ok(())
    }

    fn graph_ref(&self) -> Result<&WorkflowGraph, ConductorError> {
        self.graph
            .as_ref()
            .ok_or_else(|| ConductorError::InvalidArgument("workflow graph is not composed".to_string()))
    }

    fn flow_ref(&self) -> Result<&TaskFlow, ConductorError> {
        self.flow
            .as_ref()
            .ok_or_else(|| ConductorError::InvalidArgument("task flow is not initialized".to_string()))
    }

    fn flow_mut(&mut self) -> Result<&mut TaskFlow, ConductorError> {
        self.flow
            .as_mut()
            .ok_or_else(|| ConductorError::InvalidArgument("task flow is not initialized".to_string()))
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Captured conduction errors, in occurrence order
    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Capture a conduction error
    pub fn log_error(
        &mut self,
        message: impl Into<String>,
        task_id: Option<&str>,
        task_transition_id: Option<&str>,
    ) {
        let entry = ErrorEntry {
            message: message.into(),
            task_id: task_id.map(str::to_string),
            task_transition_id: task_transition_id.map(str::to_string),
        };

        warn!(
            message = %entry.message,
            task_id = entry.task_id.as_deref().unwrap_or(""),
            "captured workflow error"
        );

        self.errors.push(entry);
    }

    /// Capture a batch of conduction errors
    pub fn log_errors(
        &mut self,
        messages: Vec<String>,
        task_id: Option<&str>,
        task_transition_id: Option<&str>,
    ) {
        for message in messages {
            self.log_error(message, task_id, task_transition_id);
        }
    }

    // ========================================================================
    // Workflow state
    // ========================================================================

    /// Current workflow state
    pub fn get_workflow_state(&self) -> WorkflowState {
        self.workflow_state
    }

    fn set_workflow_state(&mut self, value: WorkflowState) -> Result<(), ConductorError> {
        if !WorkflowStateMachine::is_transition_valid(self.workflow_state, value) {
            return Err(StateError::InvalidWorkflowStateTransition {
                from: self.workflow_state,
                to: value,
            }
            .into());
        }

        debug!(from = %self.workflow_state, to = %value, "workflow state change");
        self.workflow_state = value;
        Ok(())
    }

    /// Request a workflow state change
    ///
    /// The request is processed through the workflow state machine; a
    /// declined change surfaces as an invalid-workflow-state-transition
    /// error.
    pub fn request_workflow_state(&mut self, state: WorkflowState) -> Result<(), ConductorError> {
        let current = self.workflow_state;
        let event = WorkflowExecutionEvent::new(state);

        if let Some(next) = WorkflowStateMachine::process_workflow_event(current, &event) {
            self.set_workflow_state(next)?;
        }

        if state != current && self.workflow_state == current {
            return Err(StateError::InvalidWorkflowStateTransition {
                from: current,
                to: state,
            }
            .into());
        }

        Ok(())
    }

    // ========================================================================
    // Context accessors
    // ========================================================================

    /// Caller-supplied workflow inputs
    pub fn get_workflow_input(&self) -> Map<String, Value> {
        self.inputs.clone()
    }

    /// Parent context supplied at construction
    pub fn get_workflow_parent_context(&self) -> Map<String, Value> {
        self.parent_ctx.clone()
    }

    /// Rendered workflow outputs, once the workflow has succeeded
    pub fn get_workflow_output(&self) -> Option<Map<String, Value>> {
        self.outputs.clone()
    }

    /// The initial context entry assembled from inputs, vars, and the
    /// parent context
    pub fn get_workflow_initial_context(&mut self) -> Result<ContextEntry, ConductorError> {
        self.ensure_flow()?;
        self.flow_ref()?
            .contexts
            .first()
            .cloned()
            .ok_or_else(|| {
                ConductorError::WorkflowContext("missing initial workflow context".to_string())
            })
    }

    fn terminal_context_idx(flow: &TaskFlow) -> Result<Option<usize>, ConductorError> {
        let matches: Vec<usize> = flow
            .contexts
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.term)
            .map(|(idx, _)| idx)
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [idx] => Ok(Some(*idx)),
            _ => Err(ConductorError::WorkflowContext(
                "more than one terminal workflow context found".to_string(),
            )),
        }
    }

    /// The terminal context entry of a completed workflow
    pub fn get_workflow_terminal_context(&mut self) -> Result<ContextEntry, ConductorError> {
        self.ensure_flow()?;

        if !self.workflow_state.is_completed() {
            return Err(ConductorError::WorkflowContext(
                "workflow is not in a completed state".to_string(),
            ));
        }

        let flow = self.flow_ref()?;
        let idx = Self::terminal_context_idx(flow)?.ok_or_else(|| {
            ConductorError::WorkflowContext(
                "unable to determine the terminal workflow context".to_string(),
            )
        })?;

        Ok(flow.contexts[idx].clone())
    }

    /// Merge a completed branch's context into the terminal entry
    fn update_terminal_context(
        flow: &mut TaskFlow,
        ctx_diff: Value,
        task_flow_idx: usize,
    ) -> Result<(), ConductorError> {
        match Self::terminal_context_idx(flow)? {
            None => {
                flow.contexts
                    .push(ContextEntry::terminal(vec![task_flow_idx], ctx_diff));
            }
            Some(idx) => {
                let entry = &mut flow.contexts[idx];
                if !entry.sources.contains(&task_flow_idx) {
                    let merged = merge_values(std::mem::take(&mut entry.value), ctx_diff);
                    entry.value = merged;
                    entry.sources.push(task_flow_idx);
                }
            }
        }
        Ok(())
    }

    /// Render workflow outputs once the workflow has succeeded
    fn render_workflow_outputs(&mut self) -> Result<(), ConductorError> {
        if self.workflow_state != WorkflowState::Succeeded || self.outputs.is_some() {
            return Ok(());
        }

        let terminal_value = {
            let flow = self.flow_ref()?;
            let idx = Self::terminal_context_idx(flow)?.ok_or_else(|| {
                ConductorError::WorkflowContext(
                    "unable to determine the terminal workflow context".to_string(),
                )
            })?;
            flow.contexts[idx].value.clone()
        };

        let (outputs, errors) = self.spec.render_output(&terminal_value);

        if !errors.is_empty() {
            self.log_errors(errors, None, None);
            self.request_workflow_state(WorkflowState::Failed)?;
        }

        if !self.workflow_state.is_abended() {
            self.outputs = outputs;
        }

        Ok(())
    }

    // ========================================================================
    // Task flow lookups
    // ========================================================================

    /// Flow index of a task's latest activation
    pub fn get_task_flow_idx(&mut self, task_id: &str) -> Result<Option<usize>, ConductorError> {
        self.ensure_flow()?;
        Ok(self.flow_ref()?.tasks.get(task_id).copied())
    }

    /// A task's latest activation entry
    pub fn get_task_flow_entry(
        &mut self,
        task_id: &str,
    ) -> Result<Option<TaskFlowEntry>, ConductorError> {
        self.ensure_flow()?;
        Ok(self.flow_ref()?.get_task_entry(task_id).cloned())
    }

    /// A copy of the task flow ledger
    pub fn get_task_flow(&mut self) -> Result<TaskFlow, ConductorError> {
        self.ensure_flow()?;
        Ok(self.flow_ref()?.clone())
    }

    /// Merge a set of context entries into one
    ///
    /// A single distinct index returns that entry unchanged; multiple
    /// distinct indices deep-merge in order with later entries winning and
    /// their source flow indices deduplicated.
    fn converge_contexts(flow: &TaskFlow, ctx_idxs: &[usize]) -> ContextEntry {
        let Some(&first) = ctx_idxs.first() else {
            return flow
                .contexts
                .first()
                .cloned()
                .unwrap_or_else(|| ContextEntry::new(Vec::new(), Value::Object(Map::new())));
        };

        if ctx_idxs.iter().all(|&idx| idx == first) {
            return flow
                .contexts
                .get(first)
                .cloned()
                .unwrap_or_else(|| ContextEntry::new(Vec::new(), Value::Object(Map::new())));
        }

        let mut sources: Vec<usize> = Vec::new();
        let mut merged = Value::Object(Map::new());

        for &idx in ctx_idxs {
            if let Some(entry) = flow.contexts.get(idx) {
                merged = merge_values(merged, entry.value.clone());
                for &src in &entry.sources {
                    if !sources.contains(&src) {
                        sources.push(src);
                    }
                }
            }
        }

        ContextEntry::new(sources, merged)
    }

    /// The context a task would start with: its recorded entry's context,
    /// or the convergence of its staged contexts
    pub fn get_task_initial_context(
        &mut self,
        task_id: &str,
    ) -> Result<ContextEntry, ConductorError> {
        self.ensure_flow()?;
        let flow = self.flow_ref()?;

        if let Some(entry) = flow.get_task_entry(task_id) {
            return flow.contexts.get(entry.ctx).cloned().ok_or_else(|| {
                ConductorError::WorkflowContext(format!(
                    "flow entry for task {task_id:?} references an invalid context index"
                ))
            });
        }

        if let Some(staged) = flow.staged.get(task_id) {
            return Ok(Self::converge_contexts(flow, &staged.ctxs));
        }

        Err(ConductorError::InvalidTaskFlowEntry(task_id.to_string()))
    }

    /// Initial contexts of the targets of a task's satisfied transitions,
    /// keyed by transition id
    pub fn get_task_transition_contexts(
        &mut self,
        task_id: &str,
    ) -> Result<BTreeMap<String, ContextEntry>, ConductorError> {
        self.ensure_flow()?;

        let entry = self
            .flow_ref()?
            .get_task_entry(task_id)
            .cloned()
            .ok_or_else(|| ConductorError::InvalidTaskFlowEntry(task_id.to_string()))?;

        let outbounds = self.graph_ref()?.get_next_transitions(task_id);
        let mut contexts = BTreeMap::new();

        for transition in outbounds {
            let transition_id = transition.transition_id();
            if entry.transition_satisfied(&transition_id) {
                contexts.insert(
                    transition_id,
                    self.get_task_initial_context(&transition.target)?,
                );
            }
        }

        Ok(contexts)
    }

    // ========================================================================
    // Task scheduling
    // ========================================================================

    /// Check whether a join barrier is satisfied by the recorded inbound
    /// transitions
    fn inbound_satisfied(graph: &WorkflowGraph, flow: &TaskFlow, task_id: &str) -> bool {
        let inbounds = graph.get_prev_transitions(task_id);

        let barrier = match graph.get_barrier(task_id) {
            Some(Barrier::All) => inbounds.len(),
            Some(Barrier::Count(count)) => count,
            None => 1,
        };

        let satisfied = inbounds
            .iter()
            .filter(|transition| {
                flow.get_task_entry(&transition.source)
                    .is_some_and(|entry| entry.transition_satisfied(&transition.transition_id()))
            })
            .count();

        satisfied >= barrier
    }

    fn render_task_spec(
        &self,
        task_name: &str,
        ctx: &Value,
    ) -> Result<RenderedTaskSpec, ConductorError> {
        let evaluator = get_evaluator(&self.spec.catalog)?;

        let Some(task_spec) = self.spec.get_task(task_name) else {
            return Ok(RenderedTaskSpec::default());
        };

        let action = evaluate(evaluator, &task_spec.action, ctx)?;
        let input = match evaluate(evaluator, &Value::Object(task_spec.input.clone()), ctx)? {
            Value::Object(input) => input,
            _ => Map::new(),
        };

        Ok(RenderedTaskSpec { action, input })
    }

    /// Build the descriptor handed to the executor for one task
    pub fn get_task(&mut self, task_id: &str) -> Result<TaskDescriptor, ConductorError> {
        self.ensure_flow()?;

        let task_name = self
            .graph_ref()?
            .get_task(task_id)
            .ok_or_else(|| ConductorError::InvalidTask(task_id.to_string()))?
            .name
            .clone();

        let ctx_value = match self.get_task_initial_context(task_id) {
            Ok(entry) => entry.value,
            Err(_) => self
                .flow_ref()?
                .contexts
                .first()
                .map(|entry| entry.value.clone())
                .unwrap_or_else(|| Value::Object(Map::new())),
        };

        let task_ctx = set_current_task(&ctx_value, json!({"id": task_id, "name": task_name}));
        let spec = self.render_task_spec(&task_name, &task_ctx)?;

        Ok(TaskDescriptor {
            id: task_id.to_string(),
            name: task_name,
            ctx: task_ctx,
            spec,
        })
    }

    /// Descriptors for the graph roots, sorted by task name
    pub fn get_start_tasks(&mut self) -> Result<Vec<TaskDescriptor>, ConductorError> {
        self.ensure_flow()?;

        if !self.workflow_state.is_running() {
            return Ok(Vec::new());
        }

        let root_ids: Vec<String> = self
            .graph_ref()?
            .roots()
            .iter()
            .map(|node| node.id.clone())
            .collect();

        let mut tasks = Vec::new();

        for root_id in root_ids {
            match self.get_task(&root_id) {
                Ok(descriptor) => tasks.push(descriptor),
                Err(e) => {
                    self.log_error(e.to_string(), Some(&root_id), None);
                    self.request_workflow_state(WorkflowState::Failed)?;
                    continue;
                }
            }
        }

        // Nothing to start if errors completed the workflow.
        if self.workflow_state.is_completed() {
            return Ok(Vec::new());
        }

        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    /// Check whether staged or follow-on work exists
    pub fn has_next_tasks(&mut self, task_id: Option<&str>) -> Result<bool, ConductorError> {
        self.ensure_flow()?;

        match task_id {
            None => Ok(self.flow_ref()?.has_staged_tasks()),
            Some(task_id) => {
                let graph = self.graph_ref()?;
                let flow = self.flow_ref()?;
                Ok(graph
                    .get_next_transitions(task_id)
                    .iter()
                    .any(|transition| Self::inbound_satisfied(graph, flow, &transition.target)))
            }
        }
    }

    /// Descriptors for the tasks to run next, sorted by task name
    ///
    /// Without a task id, every staged task whose barrier is satisfied is
    /// returned. With a task id, the task must have completed; its
    /// satisfied outbound transitions whose targets' barriers are met are
    /// followed, skipping reserved `noop` targets.
    pub fn get_next_tasks(
        &mut self,
        task_id: Option<&str>,
    ) -> Result<Vec<TaskDescriptor>, ConductorError> {
        self.ensure_flow()?;

        if !self.workflow_state.is_running() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();

        match task_id {
            None => {
                let staged: Vec<String> = self
                    .flow_ref()?
                    .get_staged_tasks()
                    .iter()
                    .map(|id| id.to_string())
                    .collect();

                for staged_id in staged {
                    match self.get_task(&staged_id) {
                        Ok(descriptor) => tasks.push(descriptor),
                        Err(e) => {
                            self.log_error(e.to_string(), Some(&staged_id), None);
                            self.request_workflow_state(WorkflowState::Failed)?;
                            continue;
                        }
                    }
                }
            }
            Some(task_id) => {
                let completed = self
                    .flow_ref()?
                    .get_task_entry(task_id)
                    .and_then(|entry| entry.state)
                    .is_some_and(|state| state.is_completed());

                if !completed {
                    return Ok(Vec::new());
                }

                let outbounds = self.graph_ref()?.get_next_transitions(task_id);

                for transition in outbounds {
                    let transition_id = transition.transition_id();

                    let satisfied = self
                        .flow_ref()?
                        .get_task_entry(task_id)
                        .is_some_and(|entry| entry.transition_satisfied(&transition_id));
                    if !satisfied {
                        continue;
                    }

                    {
                        let graph = self.graph_ref()?;
                        let flow = self.flow_ref()?;
                        if !Self::inbound_satisfied(graph, flow, &transition.target) {
                            continue;
                        }
                    }

                    let target_name = self
                        .graph_ref()?
                        .get_task(&transition.target)
                        .map(|node| node.name.clone())
                        .unwrap_or_else(|| transition.target.clone());

                    if target_name == NOOP_TASK_NAME {
                        continue;
                    }

                    match self.get_task(&transition.target) {
                        Ok(descriptor) => tasks.push(descriptor),
                        Err(e) => {
                            self.log_error(e.to_string(), Some(&transition.target), None);
                            self.request_workflow_state(WorkflowState::Failed)?;
                            continue;
                        }
                    }
                }
            }
        }

        // Nothing to run if errors completed the workflow.
        if self.workflow_state.is_completed() {
            return Ok(Vec::new());
        }

        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    // ========================================================================
    // The central update
    // ========================================================================

    /// Process an execution event for a task and return the updated entry
    ///
    /// The task must be known to the graph and either staged or already
    /// recorded in the flow. Completing a task evaluates its outbound
    /// criteria, finalizes and stages the outgoing contexts, follows
    /// reserved `noop`/`fail` targets inline, and feeds the resulting task
    /// state change into the workflow state machine.
    pub fn update_task_flow(
        &mut self,
        task_id: &str,
        event: ExecutionEvent,
    ) -> Result<TaskFlowEntry, ConductorError> {
        self.ensure_flow()?;

        debug!(task_id, kind = %event.kind, "processing execution event");

        let (task_name, in_cycle) = {
            let graph = self.graph_ref()?;
            let node = graph
                .get_task(task_id)
                .ok_or_else(|| ConductorError::InvalidTask(task_id.to_string()))?;
            (node.name.clone(), graph.in_cycle(task_id))
        };

        // Move the task out of staging, converging inbound contexts.
        let entry_idx = {
            let flow = self.flow_mut()?;

            let staged = flow.staged.remove(task_id);
            if staged.is_none() && !flow.tasks.contains_key(task_id) {
                return Err(ConductorError::InvalidTaskFlowEntry(task_id.to_string()));
            }
            let was_staged = staged.is_some();

            let mut in_ctx_idx = 0;
            if let Some(staged) = staged {
                let ctxs = staged.ctxs;
                if let Some(&first) = ctxs.first() {
                    if ctxs.iter().all(|&idx| idx == first) {
                        in_ctx_idx = first;
                    } else {
                        let converged = Self::converge_contexts(flow, &ctxs);
                        flow.contexts.push(converged);
                        in_ctx_idx = flow.contexts.len() - 1;
                    }
                }
            }

            // Completed entries are re-activated with a fresh entry when
            // the task is on a cycle or was staged again.
            let needs_entry = match flow.get_task_entry(task_id) {
                None => true,
                Some(entry) => {
                    entry.state.is_some_and(|state| state.is_completed())
                        && (in_cycle || was_staged)
                }
            };

            if needs_entry {
                flow.add_task_entry(task_id, in_ctx_idx)
            } else {
                flow.tasks[task_id]
            }
        };

        // Advance the task state machine.
        let new_state = {
            let flow = self.flow_mut()?;
            TaskStateMachine::process_event(&mut flow.sequence[entry_idx], &event)?
        };

        // Evaluate outbound transitions once the task has completed.
        if new_state.is_completed() {
            let (in_entry_ctx_idx, in_ctx_val) = {
                let flow = self.flow_ref()?;
                let entry = &flow.sequence[entry_idx];
                let value = flow.contexts.get(entry.ctx).map(|c| c.value.clone()).ok_or_else(
                    || {
                        ConductorError::WorkflowContext(format!(
                            "flow entry for task {task_id:?} references an invalid context index"
                        ))
                    },
                )?;
                (entry.ctx, value)
            };

            let current_task = json!({
                "id": task_id,
                "name": task_name,
                "result": event.result.clone().unwrap_or(Value::Null),
            });
            let scoped_ctx = set_current_task(&in_ctx_val, current_task);
            let flow_snapshot = self.flow_ref()?.serialize()?;
            let composed_ctx = merge_values(scoped_ctx, json!({ FLOW_KEY: flow_snapshot }));

            let outbounds = self.graph_ref()?.get_next_transitions(task_id);

            // A task with no outbound transitions terminates its branch.
            if outbounds.is_empty() {
                let flow = self.flow_mut()?;
                Self::update_terminal_context(flow, in_ctx_val.clone(), entry_idx)?;
            }

            let evaluator = get_evaluator(&self.spec.catalog)?;

            for transition in outbounds {
                let transition_id = transition.transition_id();

                let mut satisfied = true;
                let mut eval_error = None;
                for criterion in &transition.criteria {
                    match evaluate_string(evaluator, criterion, &composed_ctx) {
                        Ok(value) => {
                            if !is_truthy(&value) {
                                satisfied = false;
                            }
                        }
                        Err(e) => {
                            eval_error = Some(e.to_string());
                            break;
                        }
                    }
                }

                if let Some(message) = eval_error {
                    self.log_error(message, Some(task_id), Some(&transition_id));
                    self.request_workflow_state(WorkflowState::Failed)?;
                    continue;
                }

                self.flow_mut()?.sequence[entry_idx]
                    .transitions
                    .insert(transition_id.clone(), satisfied);

                if !satisfied {
                    continue;
                }

                debug!(task_id, transition = %transition_id, "transition criteria satisfied");

                let target_name = self
                    .graph_ref()?
                    .get_task(&transition.target)
                    .map(|node| node.name.clone())
                    .unwrap_or_else(|| transition.target.clone());

                // Compute the outgoing context through the edge finalizer.
                let (out_ctx_val, finalize_errors) = match self.spec.get_task(&task_name) {
                    Some(task_spec) => task_spec.finalize_context(
                        evaluator,
                        &target_name,
                        &transition.criteria,
                        &composed_ctx,
                    ),
                    None => (strip_scoped_keys(&composed_ctx), Vec::new()),
                };

                if !finalize_errors.is_empty() {
                    self.log_errors(finalize_errors, Some(task_id), Some(&transition_id));
                    self.request_workflow_state(WorkflowState::Failed)?;
                    continue;
                }

                let out_ctx_idx = if out_ctx_val != in_ctx_val {
                    let flow = self.flow_mut()?;
                    flow.contexts
                        .push(ContextEntry::new(vec![entry_idx], out_ctx_val));
                    flow.contexts.len() - 1
                } else {
                    in_entry_ctx_idx
                };

                let ready = {
                    let graph = self.graph_ref()?;
                    let flow = self.flow_ref()?;
                    Self::inbound_satisfied(graph, flow, &transition.target)
                };

                {
                    let flow = self.flow_mut()?;
                    match flow.staged.get_mut(&transition.target) {
                        Some(staged) => {
                            staged.ctxs.push(out_ctx_idx);
                            staged.ready = ready;
                        }
                        None => {
                            flow.staged.insert(
                                transition.target.clone(),
                                StagedTask {
                                    ctxs: vec![out_ctx_idx],
                                    ready,
                                },
                            );
                        }
                    }
                }

                debug!(task = %transition.target, ready, "staged next task");

                // Reserved targets complete inline.
                if target_name == NOOP_TASK_NAME {
                    self.update_task_flow(&transition.target, ExecutionEvent::noop())?;
                }
                if target_name == FAIL_TASK_NAME {
                    self.update_task_flow(&transition.target, ExecutionEvent::fail())?;
                }
            }
        }

        // Feed the task state change into the workflow state machine.
        let task_event = TaskExecutionEvent::new(task_id, event.kind, new_state);
        let derived = {
            let graph = self.graph_ref()?;
            let flow = self.flow_ref()?;
            let task_has_next = graph
                .get_next_transitions(task_id)
                .iter()
                .any(|transition| Self::inbound_satisfied(graph, flow, &transition.target));
            WorkflowStateMachine::process_task_event(
                self.workflow_state,
                flow,
                &task_event,
                task_has_next,
            )
        };
        if let Some(next) = derived {
            self.set_workflow_state(next)?;
        }

        // Fold the completing task's context into the terminal context and
        // render outputs once the workflow completes.
        if self.workflow_state.is_completed() {
            let ctx_val = {
                let flow = self.flow_ref()?;
                let entry = &flow.sequence[entry_idx];
                flow.contexts
                    .get(entry.ctx)
                    .map(|c| c.value.clone())
                    .unwrap_or_else(|| Value::Object(Map::new()))
            };

            {
                let flow = self.flow_mut()?;
                Self::update_terminal_context(flow, ctx_val, entry_idx)?;
            }

            self.render_workflow_outputs()?;
        }

        Ok(self.flow_ref()?.sequence[entry_idx].clone())
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Serialize the full conductor state for resumption
    pub fn serialize(&mut self) -> Result<Value, ConductorError> {
        self.ensure_flow()?;

        Ok(json!({
            "spec": serde_json::to_value(&self.spec)?,
            "graph": serde_json::to_value(self.graph_ref()?)?,
            "flow": self.flow_ref()?.serialize()?,
            "context": Value::Object(self.parent_ctx.clone()),
            "input": Value::Object(self.inputs.clone()),
            "output": match &self.outputs {
                Some(outputs) => Value::Object(outputs.clone()),
                None => Value::Null,
            },
            "errors": serde_json::to_value(&self.errors)?,
            "state": serde_json::to_value(self.workflow_state)?,
        }))
    }

    /// Rebuild a conductor from its serialized state
    pub fn deserialize(data: &Value) -> Result<Self, ConductorError> {
        let obj = data.as_object().ok_or_else(|| {
            ConductorError::InvalidArgument("serialized conductor must be a map".to_string())
        })?;

        let field = |name: &str| -> Result<Value, ConductorError> {
            obj.get(name).cloned().ok_or_else(|| {
                ConductorError::InvalidArgument(format!("serialized conductor is missing {name:?}"))
            })
        };

        let spec: WorkflowSpec = serde_json::from_value(field("spec")?)?;
        let graph: WorkflowGraph = serde_json::from_value(field("graph")?)?;
        let flow: TaskFlow = serde_json::from_value(field("flow")?)?;
        let state: WorkflowState = serde_json::from_value(field("state")?)?;

        let errors: Vec<ErrorEntry> = match obj.get("errors") {
            Some(errors) => serde_json::from_value(errors.clone())?,
            None => Vec::new(),
        };

        let as_map = |name: &str| -> Map<String, Value> {
            match obj.get(name) {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            }
        };

        let outputs = match obj.get("output") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };

        let mut conductor = Self::new(spec, None, None)?;
        conductor.restore(
            graph,
            Some(state),
            Some(errors),
            flow,
            Some(as_map("input")),
            outputs,
            Some(as_map("context")),
        )?;

        Ok(conductor)
    }

    /// Restore runtime state onto a freshly constructed conductor
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        &mut self,
        graph: WorkflowGraph,
        state: Option<WorkflowState>,
        errors: Option<Vec<ErrorEntry>>,
        flow: TaskFlow,
        inputs: Option<Map<String, Value>>,
        outputs: Option<Map<String, Value>>,
        context: Option<Map<String, Value>>,
    ) -> Result<(), ConductorError> {
        for entry in &flow.sequence {
            if !graph.has_task(&entry.id) {
                return Err(ConductorError::InvalidArgument(format!(
                    "flow entry references unknown task {:?}",
                    entry.id
                )));
            }
            if entry.ctx >= flow.contexts.len() {
                return Err(ConductorError::InvalidArgument(format!(
                    "flow entry for {:?} references invalid context index {}",
                    entry.id, entry.ctx
                )));
            }
        }

        for (task_id, idx) in &flow.tasks {
            if *idx >= flow.sequence.len() {
                return Err(ConductorError::InvalidArgument(format!(
                    "task {task_id:?} references invalid flow index {idx}"
                )));
            }
        }

        for (task_id, staged) in &flow.staged {
            if !graph.has_task(task_id) {
                return Err(ConductorError::InvalidArgument(format!(
                    "staged task {task_id:?} is not in the workflow graph"
                )));
            }
            if staged.ctxs.iter().any(|&idx| idx >= flow.contexts.len()) {
                return Err(ConductorError::InvalidArgument(format!(
                    "staged task {task_id:?} references an invalid context index"
                )));
            }
        }

        self.graph = Some(graph);
        self.flow = Some(flow);
        if let Some(state) = state {
            self.workflow_state = state;
        }
        self.errors = errors.unwrap_or_default();
        self.inputs = inputs.unwrap_or_default();
        self.outputs = outputs;
        self.parent_ctx = context.unwrap_or_default();

        Ok(())
    }
}

impl std::fmt::Debug for WorkflowConductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowConductor")
            .field("state", &self.workflow_state)
            .field("errors", &self.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{TaskSpec, TransitionSpec};

    fn sequential_spec() -> WorkflowSpec {
        WorkflowSpec::new("template")
            .with_task(
                "task1",
                TaskSpec::new("core.echo").with_next(
                    TransitionSpec::new()
                        .when("{{ succeeded('task1') }}")
                        .then("task2"),
                ),
            )
            .with_task("task2", TaskSpec::new("core.echo"))
    }

    #[test]
    fn test_constructor_rejects_empty_spec() {
        let result = WorkflowConductor::new(WorkflowSpec::new("template"), None, None);
        assert!(matches!(result, Err(ConductorError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_tasks_require_running_state() {
        let mut conductor = WorkflowConductor::new(sequential_spec(), None, None).unwrap();
        assert!(conductor.get_start_tasks().unwrap().is_empty());

        conductor
            .request_workflow_state(WorkflowState::Running)
            .unwrap();
        let start = conductor.get_start_tasks().unwrap();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].id, "task1");
        assert_eq!(start[0].ctx["__current_task"]["id"], json!("task1"));
    }

    #[test]
    fn test_request_workflow_state_declined() {
        let mut conductor = WorkflowConductor::new(sequential_spec(), None, None).unwrap();
        conductor
            .request_workflow_state(WorkflowState::Running)
            .unwrap();

        let err = conductor.request_workflow_state(WorkflowState::Unset);
        assert!(matches!(
            err,
            Err(ConductorError::State(
                StateError::InvalidWorkflowStateTransition { .. }
            ))
        ));
    }

    #[test]
    fn test_update_unknown_task_rejected() {
        let mut conductor = WorkflowConductor::new(sequential_spec(), None, None).unwrap();
        conductor
            .request_workflow_state(WorkflowState::Running)
            .unwrap();

        let err = conductor.update_task_flow("ghost", ExecutionEvent::started());
        assert!(matches!(err, Err(ConductorError::InvalidTask(_))));
    }

    #[test]
    fn test_update_unstaged_task_rejected() {
        let mut conductor = WorkflowConductor::new(sequential_spec(), None, None).unwrap();
        conductor
            .request_workflow_state(WorkflowState::Running)
            .unwrap();

        // task2 is not staged until task1 completes.
        let err = conductor.update_task_flow("task2", ExecutionEvent::started());
        assert!(matches!(err, Err(ConductorError::InvalidTaskFlowEntry(_))));
    }

    #[test]
    fn test_terminal_context_requires_completion() {
        let mut conductor = WorkflowConductor::new(sequential_spec(), None, None).unwrap();
        conductor
            .request_workflow_state(WorkflowState::Running)
            .unwrap();

        let err = conductor.get_workflow_terminal_context();
        assert!(matches!(err, Err(ConductorError::WorkflowContext(_))));
    }

    #[test]
    fn test_parent_context_wins_over_vars() {
        let spec = WorkflowSpec::new("template")
            .with_var("color", json!("blue"))
            .with_task("task1", TaskSpec::new("core.echo"));

        let mut parent = Map::new();
        parent.insert("color".to_string(), json!("red"));

        let mut conductor = WorkflowConductor::new(spec, Some(parent), None).unwrap();
        let initial = conductor.get_workflow_initial_context().unwrap();
        assert_eq!(initial.value["color"], json!("red"));
        assert!(initial.sources.is_empty());
    }
}
