//! Evaluator contract and recursive evaluation
//!
//! Expressions may appear anywhere inside rendered values: a string can
//! interpolate several expressions, and an expression result that is itself
//! an expression string is re-evaluated against the same context.

use serde_json::Value;

/// Re-evaluation depth cap for expressions that yield expressions
const MAX_EVALUATION_DEPTH: usize = 10;

/// Expression evaluation errors
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("syntax error in expression {expr:?}: {message}")]
    Syntax { expr: String, message: String },

    #[error("undefined variable {path:?} in expression {expr:?}")]
    UndefinedVariable { path: String, expr: String },

    #[error("unknown function {name:?} in expression {expr:?}")]
    UnknownFunction { name: String, expr: String },

    #[error("type error in expression {expr:?}: {message}")]
    TypeError { expr: String, message: String },

    #[error("unknown expression evaluator {name:?}")]
    UnknownEvaluator { name: String },

    #[error("evaluation depth exceeded for expression {expr:?}")]
    DepthExceeded { expr: String },
}

/// A named expression-evaluation strategy
///
/// Implementations evaluate a single string against a context value. The
/// traversal of nested maps and lists, and the re-evaluation of expression
/// results, is handled by [`evaluate`] and is common to all evaluators.
pub trait Evaluator: Send + Sync {
    /// Catalog name this evaluator is registered under
    fn name(&self) -> &'static str;

    /// Check if the string contains at least one expression
    fn has_expressions(&self, input: &str) -> bool;

    /// Evaluate one string, interpolating any embedded expressions
    fn evaluate_str(&self, input: &str, ctx: &Value) -> Result<Value, EvaluationError>;
}

/// Look up a registered evaluator by catalog name
pub fn get_evaluator(name: &str) -> Result<&'static dyn Evaluator, EvaluationError> {
    match name {
        crate::template::TemplateEvaluator::NAME => Ok(&crate::template::TemplateEvaluator),
        _ => Err(EvaluationError::UnknownEvaluator {
            name: name.to_string(),
        }),
    }
}

/// Evaluate a value tree against a context
///
/// Strings are evaluated through the evaluator; maps and lists are walked
/// recursively; all other values pass through unchanged.
pub fn evaluate(
    evaluator: &dyn Evaluator,
    value: &Value,
    ctx: &Value,
) -> Result<Value, EvaluationError> {
    match value {
        Value::String(s) => evaluate_string(evaluator, s, ctx),
        Value::Array(items) => {
            let evaluated = items
                .iter()
                .map(|item| evaluate(evaluator, item, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(evaluated))
        }
        Value::Object(entries) => {
            let mut evaluated = serde_json::Map::with_capacity(entries.len());
            for (key, entry) in entries {
                evaluated.insert(key.clone(), evaluate(evaluator, entry, ctx)?);
            }
            Ok(Value::Object(evaluated))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate one string, re-evaluating while the result is itself an
/// expression string
pub fn evaluate_string(
    evaluator: &dyn Evaluator,
    input: &str,
    ctx: &Value,
) -> Result<Value, EvaluationError> {
    let mut current = input.to_string();

    for _ in 0..MAX_EVALUATION_DEPTH {
        if !evaluator.has_expressions(&current) {
            return Ok(Value::String(current));
        }

        match evaluator.evaluate_str(&current, ctx)? {
            Value::String(rendered) => {
                if rendered == current {
                    return Ok(Value::String(rendered));
                }
                current = rendered;
            }
            other => return Ok(other),
        }
    }

    Err(EvaluationError::DepthExceeded {
        expr: input.to_string(),
    })
}

/// Truthiness of an evaluated criterion result
///
/// Null and false are falsy, as are zero, the empty string, and empty
/// collections; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}
