//! Conductor error types

use baton_events::StateError;
use baton_expr::EvaluationError;

use crate::graph::GraphError;

/// Errors surfaced by the conductor
///
/// Argument and shape errors are returned to the caller. Errors arising
/// from expression evaluation and rendering are instead captured into the
/// conductor's error log and fail the workflow through the state machine.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("unknown task {0:?} in workflow graph")]
    InvalidTask(String),

    #[error("task {0:?} is neither staged nor recorded in the task flow")]
    InvalidTaskFlowEntry(String),

    #[error("workflow context error: {0}")]
    WorkflowContext(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("unknown workflow composer {0:?}")]
    UnknownComposer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
