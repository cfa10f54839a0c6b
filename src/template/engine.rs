//! minijinja-backed rendering of node input bindings

use super::errors::TemplateError;
use super::filters;
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static ROOT_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[{%]-?\s*(?:if\s+|for\s+\w+\s+in\s+)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("root identifier pattern is valid")
});

/// Renders bindings against the run context
///
/// Undefined variables are errors: a binding that silently rendered as an
/// empty string would hide a broken graph until some connector choked on it.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new engine with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string to text
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String, TemplateError> {
        self.env
            .render_str(template, minijinja::Value::from_serialize(ctx))
            .map_err(|e| self.map_error(template, ctx, e))
    }

    /// Evaluate a bare expression (`steps.fetch.items`), keeping its type
    pub fn eval(&self, expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|e| TemplateError::render(expr, e.to_string()))?;
        let value = compiled
            .eval(minijinja::Value::from_serialize(ctx))
            .map_err(|e| self.map_error(expr, ctx, e))?;

        if value.is_undefined() {
            let wrapped = format!("{{{{ {} }}}}", expr);
            return Err(self.undefined(&wrapped, ctx));
        }

        serde_json::to_value(&value).map_err(|e| TemplateError::Conversion {
            template: expr.to_string(),
            message: e.to_string(),
        })
    }

    /// Render every string leaf of a binding object
    ///
    /// A string that is exactly one `{{ expression }}` keeps the expression's
    /// JSON type; any other templated string renders to text. Strings without
    /// template markers pass through untouched.
    pub fn render_bindings(
        &self,
        bindings: &Map<String, Value>,
        ctx: &Value,
    ) -> Result<Value, TemplateError> {
        let mut out = Map::with_capacity(bindings.len());
        for (key, value) in bindings {
            out.insert(key.clone(), self.render_value(value, ctx)?);
        }
        Ok(Value::Object(out))
    }

    fn render_value(&self, value: &Value, ctx: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => {
                if let Some(expr) = whole_expression(s) {
                    self.eval(expr, ctx)
                } else if s.contains("{{") || s.contains("{%") {
                    self.render(s, ctx).map(Value::String)
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.render_bindings(map, ctx),
            _ => Ok(value.clone()),
        }
    }

    fn map_error(&self, template: &str, ctx: &Value, err: minijinja::Error) -> TemplateError {
        if err.kind() == minijinja::ErrorKind::UndefinedError {
            self.undefined(template, ctx)
        } else {
            TemplateError::render(template, err.to_string())
        }
    }

    fn undefined(&self, template: &str, ctx: &Value) -> TemplateError {
        let known: Vec<&str> = ctx
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let unknown_root = ROOT_IDENT
            .captures_iter(template)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .find(|root| !known.contains(root));

        TemplateError::undefined(template, unknown_root, &known)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// `"{{ expr }}"` -> `Some("expr")`
fn whole_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let inner = inner.trim();
    if inner.is_empty() { None } else { Some(inner) }
}
