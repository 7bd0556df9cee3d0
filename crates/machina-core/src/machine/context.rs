//! Mutable execution context owned by one executor.
//!
//! An ordered string-keyed JSON map. Only the executor that owns it mutates
//! it; children receive a copy of their rendered input instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Context key holding the last error message.
pub const LAST_ERROR: &str = "last_error";
/// Context key holding the last error type name.
pub const LAST_ERROR_TYPE: &str = "last_error_type";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Build from a rendered template. Non-object values yield an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            other => {
                tracing::warn!(kind = json_kind(&other), "context template did not render to an object");
                Self::default()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Shallow-merge `patch` into the context. Later keys overwrite.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.values.insert(key, value);
        }
    }

    /// Record a failure as `last_error` / `last_error_type`.
    pub fn record_error(&mut self, error_type: &str, message: &str) {
        self.set(LAST_ERROR, Value::String(message.to_string()));
        self.set(LAST_ERROR_TYPE, Value::String(error_type.to_string()));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// `{ context }` scope for input and final-output templates.
    pub fn scope(&self) -> Value {
        json!({ "context": self.values })
    }

    /// `{ context, input, output }` scope for output mapping and transitions.
    pub fn scope_with(&self, input: &Value, output: &Value) -> Value {
        json!({ "context": self.values, "input": input, "output": output })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
