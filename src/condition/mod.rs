//! Condition evaluation for logic nodes
//!
//! A condition is a small expression tree: field comparisons on dotted paths
//! into the run context, composed with `and`, `or` and `not`.
//!
//! # Example
//!
//! ```ignore
//! use agent_flow::condition::{Condition, EvaluationMode, evaluate};
//! use serde_json::json;
//!
//! let adult_in_us = Condition::all(vec![
//!     Condition::compare("gt", "age", json!(18)),
//!     Condition::compare("eq", "country", json!("US")),
//! ]);
//!
//! let ctx = json!({"age": 20, "country": "US"});
//! assert!(evaluate(&adult_in_us, &ctx, EvaluationMode::Strict)?);
//! ```

mod evaluator;
mod path;

pub use evaluator::{ConditionError, Operator, evaluate};
pub use path::lookup;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of a condition tree
///
/// The operator is kept as written in the graph document so that an
/// unsupported operator surfaces at evaluation time, where the node's mode
/// decides whether it is an error or simply `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: String,

    /// Dotted path into the context (comparisons only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Right-hand operand (comparisons only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Children (`and`, `or`, `not`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Condition {
    /// A field comparison
    pub fn compare(operator: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        Self {
            operator: operator.into(),
            field: Some(field.into()),
            value: Some(value),
            conditions: Vec::new(),
        }
    }

    /// All children must hold
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            operator: "and".into(),
            field: None,
            value: None,
            conditions,
        }
    }

    /// At least one child must hold
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            operator: "or".into(),
            field: None,
            value: None,
            conditions,
        }
    }

    /// Negation of a single child
    pub fn negate(condition: Condition) -> Self {
        Self {
            operator: "not".into(),
            field: None,
            value: None,
            conditions: vec![condition],
        }
    }
}

/// How evaluation problems (missing fields, unknown operators, type
/// mismatches) are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Problems are errors
    Strict,
    /// Problems make the whole condition `false`
    Lenient,
}

impl std::fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationMode::Strict => write!(f, "strict"),
            EvaluationMode::Lenient => write!(f, "lenient"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_from_json() {
        let cond: Condition = serde_json::from_value(json!({
            "operator": "and",
            "conditions": [
                {"operator": "gt", "field": "age", "value": 18},
                {"operator": "eq", "field": "country", "value": "US"}
            ]
        }))
        .unwrap();

        assert_eq!(cond.operator, "and");
        assert_eq!(cond.conditions.len(), 2);
        assert_eq!(cond.conditions[0].field.as_deref(), Some("age"));
    }

    #[test]
    fn test_adult_in_us() {
        let cond = Condition::all(vec![
            Condition::compare("gt", "age", json!(18)),
            Condition::compare("eq", "country", json!("US")),
        ]);

        let adult = json!({"age": 20, "country": "US"});
        let minor = json!({"age": 16, "country": "US"});

        assert!(evaluate(&cond, &adult, EvaluationMode::Strict).unwrap());
        assert!(!evaluate(&cond, &minor, EvaluationMode::Strict).unwrap());
    }

    #[test]
    fn test_mode_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            mode: EvaluationMode,
        }
        let holder: Holder = toml::from_str(r#"mode = "lenient""#).unwrap();
        assert_eq!(holder.mode, EvaluationMode::Lenient);
        assert_eq!(holder.mode.to_string(), "lenient");
    }
}
