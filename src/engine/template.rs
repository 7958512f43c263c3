//! # Template Module
//!
//! The `TemplateEngine` seam used to render task inputs, collection items,
//! transition payloads and output mappings, plus the default
//! `ExpressionEngine` implementation.
//!
//! Strings are Jinja-style templates. A string holding exactly one
//! `{{ expr }}` block evaluates to the typed result of the expression, so
//! `"{{ workflow.input.items }}"` yields an array rather than its text.
//! JSON objects passed to [`TemplateEngine::evaluate`] are JSONLogic rules.

use crate::engine::error::{Result, TaskflowError};
use datalogic_rs::DataLogic;
use log::debug;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Renders templates and evaluates expressions against a JSON context
pub trait TemplateEngine: Send + Sync {
    /// Render a template string to text
    fn render_str(&self, template: &str, context: &Value) -> Result<String>;

    /// Evaluate an expression: a template string, a JSONLogic object or a literal
    fn evaluate(&self, expression: &Value, context: &Value) -> Result<Value>;

    /// Render every string leaf of a value, keeping its structure
    fn render_value(&self, value: &Value, context: &Value) -> Result<Value> {
        match value {
            Value::String(template) => self.evaluate(&Value::String(template.clone()), context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => self.render_map(map, context).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Render every value of a map
    fn render_map(&self, map: &Map<String, Value>, context: &Value) -> Result<Map<String, Value>> {
        let mut rendered = Map::with_capacity(map.len());
        for (key, value) in map {
            rendered.insert(key.clone(), self.render_value(value, context)?);
        }
        Ok(rendered)
    }
}

/// Default engine: minijinja for strings, datalogic for JSONLogic objects
pub struct ExpressionEngine {
    env: Environment<'static>,
    datalogic: Arc<DataLogic>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        Self {
            env,
            datalogic: Arc::new(DataLogic::with_preserve_structure()),
        }
    }

    /// Share an existing DataLogic instance
    pub fn with_datalogic(datalogic: Arc<DataLogic>) -> Self {
        Self {
            datalogic,
            ..Self::new()
        }
    }

    fn evaluate_template(&self, template: &str, context: &Value) -> Result<Value> {
        if let Some(expression) = single_expression(template) {
            let compiled = self.env.compile_expression(expression).map_err(|e| {
                TaskflowError::Template(format!("failed to compile expression '{expression}': {e}"))
            })?;
            let result = compiled.eval(context).map_err(|e| {
                TaskflowError::Template(format!("failed to evaluate expression '{expression}': {e}"))
            })?;
            return serde_json::to_value(&result).map_err(TaskflowError::from);
        }
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(Value::String(template.to_string()));
        }
        self.render_str(template, context).map(Value::String)
    }

    fn evaluate_logic(&self, logic: &Value, context: &Value) -> Result<Value> {
        let compiled = self
            .datalogic
            .compile(logic)
            .map_err(|e| TaskflowError::Template(format!("failed to compile logic: {e}")))?;
        self.datalogic
            .evaluate(&compiled, Arc::new(context.clone()))
            .map_err(|e| TaskflowError::Template(format!("failed to evaluate logic: {e}")))
    }
}

impl TemplateEngine for ExpressionEngine {
    fn render_str(&self, template: &str, context: &Value) -> Result<String> {
        self.env
            .render_str(template, context)
            .map_err(|e| TaskflowError::Template(format!("failed to render template: {e}")))
    }

    fn evaluate(&self, expression: &Value, context: &Value) -> Result<Value> {
        match expression {
            Value::String(template) => self.evaluate_template(template, context),
            Value::Object(_) => {
                debug!("Evaluating JSONLogic expression");
                self.evaluate_logic(expression, context)
            }
            Value::Array(_) => self.render_value(expression, context),
            other => Ok(other.clone()),
        }
    }
}

/// Inner expression of a string made of exactly one `{{ ... }}` block
fn single_expression(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
