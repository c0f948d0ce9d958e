//! Declarative workflow spec model
//!
//! A spec is the parsed, immutable description of a workflow: declared
//! inputs, derived vars, output mappings, and a table of tasks with their
//! outbound transitions. Parsing from source text is an external concern;
//! specs are constructed programmatically or deserialized.
//!
//! Rendering runs every expression-bearing field through the evaluator
//! registered under the spec's catalog name. Render methods collect error
//! strings instead of failing fast so the conductor can log the full set
//! before failing the workflow.

use std::collections::BTreeMap;

use baton_expr::{evaluate, get_evaluator, Evaluator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{merge_values, strip_scoped_keys};
use crate::graph::Barrier;

/// A declared workflow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Input name
    pub name: String,
    /// Whether the caller must supply a value
    #[serde(default)]
    pub required: bool,
    /// Default value, possibly expression-bearing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// An outbound transition declared on a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    /// Criteria expressions; all must be truthy for the transition to fire
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<String>,
    /// Context values published into the outgoing context when firing
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub publish: Map<String, Value>,
    /// Target task names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub then: Vec<String>,
}

impl TransitionSpec {
    /// Create an empty transition
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a criterion expression
    pub fn when(mut self, criterion: &str) -> Self {
        self.when.push(criterion.to_string());
        self
    }

    /// Publish a context value when the transition fires
    pub fn publish(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.publish.insert(name.to_string(), value.into());
        self
    }

    /// Add a target task
    pub fn then(mut self, task_name: &str) -> Self {
        self.then.push(task_name.to_string());
        self
    }
}

/// A task declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Action descriptor handed to the executor; expression-bearing
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub action: Value,
    /// Action input values; expression-bearing
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    /// Join barrier when the task has multiple inbound transitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Barrier>,
    /// Outbound transitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<TransitionSpec>,
}

impl TaskSpec {
    /// Create a task spec with an action descriptor
    pub fn new(action: impl Into<Value>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    /// Add an action input value
    pub fn with_input(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.input.insert(name.to_string(), value.into());
        self
    }

    /// Declare a join barrier
    pub fn with_join(mut self, barrier: Barrier) -> Self {
        self.join = Some(barrier);
        self
    }

    /// Add an outbound transition
    pub fn with_next(mut self, transition: TransitionSpec) -> Self {
        self.next.push(transition);
        self
    }

    /// Compute the outgoing context for a firing transition
    ///
    /// The evaluation scratch keys are stripped from the rolled-over copy;
    /// the matching transition's publish map is rendered against the full
    /// composed context and merged on top. Returns the outgoing context
    /// value and any evaluation errors.
    pub fn finalize_context(
        &self,
        evaluator: &dyn Evaluator,
        next_task_name: &str,
        criteria: &[String],
        ctx: &Value,
    ) -> (Value, Vec<String>) {
        let mut out_ctx = strip_scoped_keys(ctx);
        let mut errors = Vec::new();

        let transition = self
            .next
            .iter()
            .find(|t| t.when == criteria && t.then.iter().any(|name| name == next_task_name));

        if let Some(transition) = transition {
            if !transition.publish.is_empty() {
                match evaluate(evaluator, &Value::Object(transition.publish.clone()), ctx) {
                    Ok(published) => out_ctx = merge_values(out_ctx, published),
                    Err(e) => errors.push(e.to_string()),
                }
            }
        }

        (out_ctx, errors)
    }
}

/// A complete workflow spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Catalog name used to look up the evaluator and composer
    pub catalog: String,
    /// Declared workflow inputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputSpec>,
    /// Derived variables rendered against the rendered inputs
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    /// Output mappings rendered against the terminal context
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,
    /// Task table keyed by task name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, TaskSpec>,
}

impl WorkflowSpec {
    /// Create an empty spec for a catalog
    pub fn new(catalog: &str) -> Self {
        Self {
            catalog: catalog.to_string(),
            input: Vec::new(),
            vars: Map::new(),
            output: Map::new(),
            tasks: BTreeMap::new(),
        }
    }

    /// Declare a workflow input
    pub fn with_input(mut self, name: &str, required: bool, default: Option<Value>) -> Self {
        self.input.push(InputSpec {
            name: name.to_string(),
            required,
            default,
        });
        self
    }

    /// Declare a derived variable
    pub fn with_var(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    /// Declare an output mapping
    pub fn with_output(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.output.insert(name.to_string(), value.into());
        self
    }

    /// Declare a task
    pub fn with_task(mut self, name: &str, task: TaskSpec) -> Self {
        self.tasks.insert(name.to_string(), task);
        self
    }

    /// Look up a task by name
    pub fn get_task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    /// Render declared inputs against caller-supplied values
    ///
    /// Caller values win over defaults; defaults are rendered against the
    /// caller values. Missing required inputs and evaluation failures are
    /// collected as error strings.
    pub fn render_input(
        &self,
        caller_inputs: &Map<String, Value>,
    ) -> (Map<String, Value>, Vec<String>) {
        let mut rendered = Map::new();
        let mut errors = Vec::new();

        let evaluator = match get_evaluator(&self.catalog) {
            Ok(evaluator) => evaluator,
            Err(e) => {
                errors.push(e.to_string());
                return (rendered, errors);
            }
        };

        let ctx = Value::Object(caller_inputs.clone());

        for input in &self.input {
            if let Some(value) = caller_inputs.get(&input.name) {
                rendered.insert(input.name.clone(), value.clone());
                continue;
            }

            match &input.default {
                Some(default) => match evaluate(evaluator, default, &ctx) {
                    Ok(value) => {
                        rendered.insert(input.name.clone(), value);
                    }
                    Err(e) => errors.push(e.to_string()),
                },
                None if input.required => {
                    errors.push(format!("missing required workflow input {:?}", input.name));
                }
                None => {}
            }
        }

        (rendered, errors)
    }

    /// Render derived variables against the rendered inputs
    ///
    /// Vars render in name order and may reference previously rendered
    /// vars as well as the inputs.
    pub fn render_vars(
        &self,
        rendered_inputs: &Map<String, Value>,
    ) -> (Map<String, Value>, Vec<String>) {
        let mut rendered = Map::new();
        let mut errors = Vec::new();

        let evaluator = match get_evaluator(&self.catalog) {
            Ok(evaluator) => evaluator,
            Err(e) => {
                errors.push(e.to_string());
                return (rendered, errors);
            }
        };

        for (name, value) in &self.vars {
            let mut scope = rendered_inputs.clone();
            scope.extend(rendered.clone());

            match evaluate(evaluator, value, &Value::Object(scope)) {
                Ok(value) => {
                    rendered.insert(name.clone(), value);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        (rendered, errors)
    }

    /// Render output mappings against the terminal context value
    pub fn render_output(
        &self,
        terminal_ctx: &Value,
    ) -> (Option<Map<String, Value>>, Vec<String>) {
        if self.output.is_empty() {
            return (None, Vec::new());
        }

        let mut errors = Vec::new();

        let evaluator = match get_evaluator(&self.catalog) {
            Ok(evaluator) => evaluator,
            Err(e) => {
                errors.push(e.to_string());
                return (None, errors);
            }
        };

        match evaluate(evaluator, &Value::Object(self.output.clone()), terminal_ctx) {
            Ok(Value::Object(rendered)) => (Some(rendered), errors),
            Ok(_) => (None, errors),
            Err(e) => {
                errors.push(e.to_string());
                (None, errors)
            }
        }
    }
}
