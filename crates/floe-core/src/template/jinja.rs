//! minijinja-backed [`ExpressionRenderer`].
//!
//! Undefined variables are errors, so a typo in a task property fails the
//! task run instead of dispatching an empty string. The environment has no
//! loader and no I/O filters; rendering only reads the variables it is given.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use serde_json::Map;

use crate::error::{CoreError, CoreResult};
use crate::template::ExpressionRenderer;

pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("tojson", tojson);
        env.add_filter("fromjson", fromjson);
        env.add_filter("b64encode", b64encode);
        env.add_filter("b64decode", b64decode);
        env.add_filter("keys", keys);

        Self { env }
    }
}

impl ExpressionRenderer for TemplateRenderer {
    fn render(&self, template: &str, variables: &Map<String, serde_json::Value>) -> CoreResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        self.env
            .render_str(template, Value::from_serialize(variables))
            .map_err(|e| CoreError::Template(describe(&e)))
    }
}

/// Whether `s` holds an expression or a statement block.
pub fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// One-line error text including the failing expression's line when known.
fn describe(err: &Error) -> String {
    match err.line() {
        Some(line) => format!("{} (line {})", err, line),
        None => err.to_string(),
    }
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

fn tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| invalid(format!("tojson: {}", e)))
}

fn fromjson(value: &str) -> Result<Value, Error> {
    serde_json::from_str::<serde_json::Value>(value)
        .map(Value::from_serialize)
        .map_err(|e| invalid(format!("fromjson: {}", e)))
}

fn b64encode(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

fn b64decode(value: &str) -> Result<String, Error> {
    let bytes = BASE64
        .decode(value.as_bytes())
        .map_err(|e| invalid(format!("b64decode: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| invalid(format!("b64decode: {}", e)))
}

fn keys(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(invalid("keys: expected a mapping".to_string()));
    }
    Ok(value.try_iter()?.collect())
}
