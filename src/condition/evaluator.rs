//! Evaluation of condition trees

use super::path::lookup;
use super::{Condition, EvaluationMode};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Problems found while evaluating a condition in strict mode
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("field '{field}' not found in context")]
    MissingField { field: String },

    #[error("unsupported operator '{operator}'")]
    UnsupportedOperator { operator: String },

    #[error("operator '{operator}' requires {operand}")]
    MissingOperand {
        operator: String,
        operand: &'static str,
    },

    #[error("type mismatch for '{operator}': {message}")]
    TypeMismatch { operator: String, message: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Supported operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Matches,
    Exists,
    And,
    Or,
    Not,
}

impl Operator {
    /// Parse an operator name; camelCase and snake_case are both accepted
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.trim() {
            "eq" | "==" => Self::Eq,
            "neq" | "ne" | "!=" => Self::Neq,
            "gt" | ">" => Self::Gt,
            "gte" | ">=" => Self::Gte,
            "lt" | "<" => Self::Lt,
            "lte" | "<=" => Self::Lte,
            "contains" => Self::Contains,
            "startsWith" | "starts_with" => Self::StartsWith,
            "endsWith" | "ends_with" => Self::EndsWith,
            "in" => Self::In,
            "notIn" | "not_in" => Self::NotIn,
            "matches" => Self::Matches,
            "exists" => Self::Exists,
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            _ => return None,
        };
        Some(op)
    }
}

/// Evaluate a condition against a context
///
/// In lenient mode any evaluation problem turns the whole condition into
/// `false`; in strict mode it is returned as an error.
pub fn evaluate(
    condition: &Condition,
    context: &Value,
    mode: EvaluationMode,
) -> Result<bool, ConditionError> {
    match (eval_node(condition, context), mode) {
        (Ok(result), _) => Ok(result),
        (Err(e), EvaluationMode::Strict) => Err(e),
        (Err(e), EvaluationMode::Lenient) => {
            tracing::debug!(error = %e, "Lenient condition treated as false");
            Ok(false)
        }
    }
}

fn eval_node(condition: &Condition, context: &Value) -> Result<bool, ConditionError> {
    let operator = Operator::parse(&condition.operator).ok_or_else(|| {
        ConditionError::UnsupportedOperator {
            operator: condition.operator.clone(),
        }
    })?;

    match operator {
        Operator::And => {
            for child in &condition.conditions {
                if !eval_node(child, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Operator::Or => {
            for child in &condition.conditions {
                if eval_node(child, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Operator::Not => match condition.conditions.as_slice() {
            [child] => Ok(!eval_node(child, context)?),
            _ => Err(ConditionError::MissingOperand {
                operator: condition.operator.clone(),
                operand: "exactly one child condition",
            }),
        },
        Operator::Exists => {
            let field = require_field(condition)?;
            Ok(lookup(context, field).is_some_and(|v| !v.is_null()))
        }
        _ => {
            let field = require_field(condition)?;
            let actual = lookup(context, field).ok_or_else(|| ConditionError::MissingField {
                field: field.to_string(),
            })?;
            let expected = condition
                .value
                .as_ref()
                .ok_or_else(|| ConditionError::MissingOperand {
                    operator: condition.operator.clone(),
                    operand: "a value",
                })?;
            compare(operator, &condition.operator, actual, expected)
        }
    }
}

fn require_field(condition: &Condition) -> Result<&str, ConditionError> {
    condition
        .field
        .as_deref()
        .ok_or_else(|| ConditionError::MissingOperand {
            operator: condition.operator.clone(),
            operand: "a field",
        })
}

fn compare(
    operator: Operator,
    name: &str,
    actual: &Value,
    expected: &Value,
) -> Result<bool, ConditionError> {
    let mismatch = |message: String| ConditionError::TypeMismatch {
        operator: name.to_string(),
        message,
    };

    match operator {
        Operator::Eq => Ok(values_equal(actual, expected)),
        Operator::Neq => Ok(!values_equal(actual, expected)),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ordering = order(actual, expected).ok_or_else(|| {
                mismatch(format!(
                    "cannot order {} against {}",
                    type_name(actual),
                    type_name(expected)
                ))
            })?;
            Ok(match operator {
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Gte => ordering != Ordering::Less,
                Operator::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Operator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
            (Value::Array(items), needle) => Ok(items.iter().any(|i| values_equal(i, needle))),
            _ => Err(mismatch(format!(
                "field is {}, expected string or array",
                type_name(actual)
            ))),
        },
        Operator::StartsWith | Operator::EndsWith | Operator::Matches => {
            let (Value::String(text), Value::String(pattern)) = (actual, expected) else {
                return Err(mismatch(format!(
                    "expected strings, got {} and {}",
                    type_name(actual),
                    type_name(expected)
                )));
            };
            match operator {
                Operator::StartsWith => Ok(text.starts_with(pattern.as_str())),
                Operator::EndsWith => Ok(text.ends_with(pattern.as_str())),
                _ => {
                    let re = Regex::new(pattern).map_err(|e| ConditionError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })?;
                    Ok(re.is_match(text))
                }
            }
        }
        Operator::In | Operator::NotIn => {
            let Value::Array(candidates) = expected else {
                return Err(mismatch(format!(
                    "value must be an array, got {}",
                    type_name(expected)
                )));
            };
            let found = candidates.iter().any(|c| values_equal(actual, c));
            Ok(if operator == Operator::In { found } else { !found })
        }
        Operator::Exists | Operator::And | Operator::Or | Operator::Not => {
            unreachable!("handled in eval_node")
        }
    }
}

/// Equality with numeric normalisation, so `18 == 18.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
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
