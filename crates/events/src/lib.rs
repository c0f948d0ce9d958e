//! Baton Events - execution states and executor-facing event types
//!
//! This crate defines the protocol vocabulary between the conductor and the
//! external executor that actually runs tasks:
//! - Task and workflow execution states with their group predicates
//! - Typed execution events the executor reports back to the conductor

pub mod state;
pub mod types;

pub use state::*;
pub use types::*;
