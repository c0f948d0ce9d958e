//! Baton Expr - expression evaluation for transition criteria and rendering
//!
//! The conductor treats expression evaluation as a pure function
//! `evaluate(expr, ctx) -> value | error`. This crate provides:
//! - The `Evaluator` trait and a registry of named evaluators
//! - Recursive evaluation over nested values with `{{ ... }}` interpolation
//! - The built-in `"template"` evaluator used for transition criteria

pub mod eval;
pub mod template;

pub use eval::*;
pub use template::*;
