//! Expression rendering.
//!
//! The engine only depends on [`ExpressionRenderer`]; [`TemplateRenderer`]
//! is the minijinja implementation used by default.

mod jinja;

use serde_json::{Map, Value};

use crate::error::CoreResult;

pub use jinja::{contains_template_syntax, TemplateRenderer};

/// Pure `render(template, variables) -> value` function.
pub trait ExpressionRenderer: Send + Sync {
    /// Render a template string.
    fn render(&self, template: &str, variables: &Map<String, Value>) -> CoreResult<String>;

    /// Render a template and parse the result as JSON when it looks like it.
    fn render_to_value(&self, template: &str, variables: &Map<String, Value>) -> CoreResult<Value> {
        if !contains_template_syntax(template) {
            return Ok(Value::String(template.to_string()));
        }

        let rendered = self.render(template, variables)?;
        let trimmed = rendered.trim();

        if (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        {
            if let Ok(value) = serde_json::from_str(trimmed) {
                return Ok(value);
            }
        }
        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(Value::Bool(b));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(Value::Number(i.into()));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(Value::Number(n));
            }
        }
        if trimmed == "null" || trimmed == "None" {
            return Ok(Value::Null);
        }

        Ok(Value::String(rendered))
    }

    /// Render every string of a nested structure.
    fn render_value(&self, value: &Value, variables: &Map<String, Value>) -> CoreResult<Value> {
        match value {
            Value::String(s) => self.render_to_value(s, variables),
            Value::Object(map) => {
                let mut result = Map::new();
                for (k, v) in map {
                    result.insert(self.render(k, variables)?, self.render_value(v, variables)?);
                }
                Ok(Value::Object(result))
            }
            Value::Array(arr) => arr
                .iter()
                .map(|v| self.render_value(v, variables))
                .collect::<CoreResult<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(value.clone()),
        }
    }
}
