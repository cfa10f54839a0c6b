//! Param validation against a node's declared input schema

use crate::config::{InputSchema, PropertySchema};
use crate::error::StepError;
use serde_json::Value;

/// Check rendered params against an input schema
///
/// All problems are collected into one validation error.
pub fn validate_params(schema: &InputSchema, params: &Value) -> Result<(), StepError> {
    let Some(object) = params.as_object() else {
        return Err(StepError::validation(format!(
            "params must be an object, got {}",
            type_name(params)
        )));
    };

    let mut problems = Vec::new();

    for key in &schema.required {
        match object.get(key) {
            None | Some(Value::Null) => problems.push(format!("missing required param '{}'", key)),
            Some(_) => {}
        }
    }

    let mut keys: Vec<&String> = schema.properties.keys().collect();
    keys.sort();
    for key in keys {
        if let Some(value) = object.get(key) {
            check_type(key, &schema.properties[key], value, &mut problems);
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StepError::validation(problems.join("; ")))
    }
}

fn check_type(path: &str, schema: &PropertySchema, value: &Value, problems: &mut Vec<String>) {
    let ok = match schema.prop_type.as_str() {
        "any" => true,
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        other => {
            problems.push(format!("param '{}' declares unknown type '{}'", path, other));
            return;
        }
    };

    if !ok {
        problems.push(format!(
            "param '{}' must be {}, got {}",
            path,
            schema.prop_type,
            type_name(value)
        ));
        return;
    }

    if let (Some(items), Some(array)) = (schema.items.as_deref(), value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            check_type(&format!("{}[{}]", path, i), items, item, problems);
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn schema() -> InputSchema {
        serde_json::from_value(json!({
            "required": ["to", "subject"],
            "properties": {
                "to": {"type": "string"},
                "subject": {"type": "string"},
                "priority": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_params() {
        let params = json!({"to": "a@b.c", "subject": "hi", "priority": 2, "tags": ["x"]});
        assert!(validate_params(&schema(), &params).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate_params(&schema(), &json!({"to": "a@b.c", "subject": null})).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Validation { .. }));
        assert!(err.message().contains("'subject'"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_type_mismatch_collects_all() {
        let params = json!({"to": 5, "subject": "hi", "priority": 1.5, "tags": ["ok", 3]});
        let err = validate_params(&schema(), &params).unwrap_err();
        let msg = err.message();
        assert!(msg.contains("'to' must be string"));
        assert!(msg.contains("'priority' must be integer"));
        assert!(msg.contains("'tags[1]' must be string"));
    }

    #[test]
    fn test_params_must_be_object() {
        let err = validate_params(&InputSchema::default(), &json!([1])).unwrap_err();
        assert!(err.message().contains("object"));
    }
}
