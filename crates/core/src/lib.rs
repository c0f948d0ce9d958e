//! Baton Core - workflow graph, state machines, task flow, and conductor
//!
//! This crate provides the decision engine for Baton workflows, including:
//! - Directed multigraph representation of workflows with keyed transitions
//! - Task and workflow state machines as transition tables
//! - The task flow ledger and append-only context store
//! - The `WorkflowConductor` that decides which tasks run next

pub mod compose;
pub mod conductor;
pub mod context;
pub mod error;
pub mod flow;
pub mod graph;
pub mod machine;
pub mod spec;

pub use compose::*;
pub use conductor::*;
pub use context::*;
pub use error::*;
pub use flow::*;
pub use graph::*;
pub use machine::*;
pub use spec::*;
