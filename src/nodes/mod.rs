//! Built-in node executors: entry/exit passthrough, conditional branch,
//! string functions, HTTP action, webhook notification and the LLM agent.

pub mod agent;
pub mod basic;
pub mod branch;
pub mod function;
pub mod http;
pub mod notify;

use serde_json::Value;

use crate::flow::NodeSpec;
use crate::node::JsonMap;

/// The node's input value, looked up under its declared `inputParams` key.
/// Missing input resolves to the empty string; the engine already applied
/// the variable-namespace fallback chain before calling the executor.
pub(crate) fn input_value(node: &NodeSpec, input: &JsonMap) -> Value {
    input
        .get(&node.data.config.input_params)
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

/// Render a JSON value as the plain string nodes operate on.
pub(crate) fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
