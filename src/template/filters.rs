//! Custom template filters

use minijinja::value::Value;
use minijinja::{Error, ErrorKind};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("json", filter_json);
    env.add_filter("default", filter_default);
    env.add_filter("lines", filter_lines);
    env.add_filter("pluck", filter_pluck);
}

/// Serialize value to a JSON string
fn filter_json(value: Value) -> Result<Value, Error> {
    let json = serde_json::to_string(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })?;
    Ok(Value::from(json))
}

/// Return a default value if the input is undefined, none or an empty string
fn filter_default(value: Value, default: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        Ok(default)
    } else if let Some(s) = value.as_str() {
        if s.is_empty() { Ok(default) } else { Ok(value) }
    } else {
        Ok(value)
    }
}

/// Split a string into lines
fn filter_lines(value: Value) -> Result<Value, Error> {
    let s = value.as_str().ok_or_else(|| {
        Error::new(ErrorKind::InvalidOperation, "lines filter requires a string")
    })?;
    Ok(Value::from(
        s.lines().map(|l| l.to_string()).collect::<Vec<_>>(),
    ))
}

/// Pick one attribute from every object in a list (`messages | pluck("id")`)
fn filter_pluck(value: Value, key: &str) -> Result<Value, Error> {
    let iter = value.try_iter().map_err(|_| {
        Error::new(ErrorKind::InvalidOperation, "pluck filter requires a sequence")
    })?;
    let picked: Vec<Value> = iter
        .map(|item| item.get_attr(key).unwrap_or(Value::UNDEFINED))
        .filter(|v| !v.is_undefined())
        .collect();
    Ok(Value::from(picked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;
    use serde_json::json;

    fn env() -> Environment<'static> {
        let mut env = Environment::new();
        register_filters(&mut env);
        env
    }

    #[test]
    fn test_json_filter() {
        let out = env()
            .render_str("{{ data | json }}", Value::from_serialize(json!({"data": {"a": 1}})))
            .unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn test_default_filter_on_empty_string() {
        let out = env()
            .render_str("{{ name | default('anon') }}", Value::from_serialize(json!({"name": ""})))
            .unwrap();
        assert_eq!(out, "anon");
    }

    #[test]
    fn test_lines_filter() {
        let out = env()
            .render_str(
                "{{ (text | lines) | length }}",
                Value::from_serialize(json!({"text": "a\nb\nc"})),
            )
            .unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn test_pluck_filter() {
        let ctx = json!({"messages": [{"id": "m1"}, {"id": "m2"}, {"other": 1}]});
        let out = env()
            .render_str("{{ messages | pluck('id') | join(',') }}", Value::from_serialize(ctx))
            .unwrap();
        assert_eq!(out, "m1,m2");
    }
}
