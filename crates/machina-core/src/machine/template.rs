//! Template rendering for state inputs, output mappings, and final outputs.
//!
//! The executor only depends on the [`TemplateRenderer`] trait. The default
//! [`JinjaRenderer`] uses minijinja. A string that is exactly one `{{ expr }}`
//! is evaluated as an expression so lists, numbers and objects keep their
//! JSON type. Any other string containing template syntax renders to text.
//! Objects and arrays are rendered recursively; keys are left alone.

use minijinja::Environment;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("template error in {template:?}: {message}")]
pub struct TemplateError {
    pub template: String,
    pub message: String,
}

impl TemplateError {
    fn new(template: &str, err: impl std::fmt::Display) -> Self {
        Self {
            template: template.to_string(),
            message: err.to_string(),
        }
    }
}

/// Renders a JSON template against a JSON object of variables.
///
/// Synchronous and total: failures surface as [`TemplateError`] and are
/// treated as state-execution failures.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &Value, vars: &Value) -> Result<Value, TemplateError>;
}

/// minijinja-backed renderer.
pub struct JinjaRenderer {
    env: Environment<'static>,
}

impl Default for JinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JinjaRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JinjaRenderer").finish_non_exhaustive()
    }
}

impl JinjaRenderer {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Use a pre-configured environment (custom filters, undefined behavior).
    pub fn with_environment(env: Environment<'static>) -> Self {
        Self { env }
    }

    fn render_str(&self, template: &str, vars: &minijinja::Value) -> Result<Value, TemplateError> {
        if !contains_template_syntax(template) {
            return Ok(Value::String(template.to_string()));
        }

        if let Some(expr) = single_expression(template) {
            let compiled = self
                .env
                .compile_expression(expr)
                .map_err(|e| TemplateError::new(template, e))?;
            let result = compiled
                .eval(vars)
                .map_err(|e| TemplateError::new(template, e))?;
            return serde_json::to_value(&result).map_err(|e| TemplateError::new(template, e));
        }

        self.env
            .render_str(template, vars)
            .map(Value::String)
            .map_err(|e| TemplateError::new(template, e))
    }

    fn render_value(&self, template: &Value, vars: &minijinja::Value) -> Result<Value, TemplateError> {
        match template {
            Value::String(s) => self.render_str(s, vars),
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (key, value) in map {
                    rendered.insert(key.clone(), self.render_value(value, vars)?);
                }
                Ok(Value::Object(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, vars))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

impl TemplateRenderer for JinjaRenderer {
    fn render(&self, template: &Value, vars: &Value) -> Result<Value, TemplateError> {
        let vars = minijinja::Value::from_serialize(vars);
        self.render_value(template, &vars)
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// The inner expression if `s` is exactly one `{{ ... }}` block.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    let inner = inner.trim();
    (!inner.is_empty()).then_some(inner)
}
