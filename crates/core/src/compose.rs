//! Spec-to-graph composition
//!
//! Composers turn a workflow spec into the executable graph. They are
//! registered by catalog name alongside the expression evaluators so a spec
//! names one strategy for both.

use crate::error::ConductorError;
use crate::graph::{GraphError, WorkflowGraph};
use crate::spec::WorkflowSpec;

/// Reserved task name that completes silently and is never handed out
pub const NOOP_TASK_NAME: &str = "noop";

/// Reserved task name that completes as a failure
pub const FAIL_TASK_NAME: &str = "fail";

/// A named spec-to-graph composition strategy
pub trait Composer: Send + Sync {
    /// Catalog name this composer is registered under
    fn name(&self) -> &'static str;

    /// Compose a workflow spec into a graph
    fn compose(&self, spec: &WorkflowSpec) -> Result<WorkflowGraph, GraphError>;
}

/// Look up a registered composer by catalog name
pub fn get_composer(name: &str) -> Result<&'static dyn Composer, ConductorError> {
    match name {
        "template" | "direct" => Ok(&DirectComposer),
        _ => Err(ConductorError::UnknownComposer(name.to_string())),
    }
}

/// The built-in composer: one node per declared task, one keyed edge per
/// transition target
///
/// Task ids equal task names. Reserved `noop`/`fail` targets referenced by
/// transitions are added as nodes implicitly; any other undeclared target
/// is a composition error.
pub struct DirectComposer;

impl Composer for DirectComposer {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn compose(&self, spec: &WorkflowSpec) -> Result<WorkflowGraph, GraphError> {
        let mut graph = WorkflowGraph::new();

        for name in spec.tasks.keys() {
            graph.add_task(name, name)?;
        }

        // Reserved targets get implicit nodes.
        for task in spec.tasks.values() {
            for transition in &task.next {
                for target in &transition.then {
                    if graph.has_task(target) {
                        continue;
                    }
                    if target == NOOP_TASK_NAME || target == FAIL_TASK_NAME {
                        graph.add_task(target, target)?;
                    } else {
                        return Err(GraphError::TaskNotFound(target.clone()));
                    }
                }
            }
        }

        for (name, task) in &spec.tasks {
            for transition in &task.next {
                for target in &transition.then {
                    graph.add_transition(
                        name,
                        target,
                        transition.when.clone(),
                        transition.publish.clone(),
                    )?;
                }
            }

            if let Some(barrier) = task.join {
                graph.set_barrier(name, barrier)?;
            }
        }

        Ok(graph)
    }
}
