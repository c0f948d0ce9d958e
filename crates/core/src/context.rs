//! Context merge and scoping utilities
//!
//! Contexts are nested JSON maps carried along transitions. Merging is deep
//! for maps with the overlay winning on conflict; every other value type is
//! replaced outright.

use serde_json::Value;

/// Key under which the current task is exposed to expressions
pub const CURRENT_TASK_KEY: &str = "__current_task";

/// Key under which the serialized flow is exposed to expressions
pub const FLOW_KEY: &str = "__flow";

/// Deep-merge `overlay` onto `base`; maps merge recursively, overlay wins
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let value = match merged.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Copy a context value with the current task injected under
/// [`CURRENT_TASK_KEY`]
pub fn set_current_task(ctx: &Value, current_task: Value) -> Value {
    let mut scoped = match ctx {
        Value::Object(entries) => entries.clone(),
        _ => serde_json::Map::new(),
    };
    scoped.insert(CURRENT_TASK_KEY.to_string(), current_task);
    Value::Object(scoped)
}

/// Copy a context value with the evaluation-scratch keys removed
pub fn strip_scoped_keys(ctx: &Value) -> Value {
    match ctx {
        Value::Object(entries) => {
            let mut stripped = entries.clone();
            stripped.remove(CURRENT_TASK_KEY);
            stripped.remove(FLOW_KEY);
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}
