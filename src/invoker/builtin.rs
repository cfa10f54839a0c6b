//! Built-in handlers for trigger, logic and passthrough nodes

use super::registry::{Invocation, StepHandler};
use crate::condition::{evaluate, lookup};
use crate::error::StepError;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

/// Returns the trigger payload, with params layered on top
pub struct TriggerHandler;

#[async_trait]
impl StepHandler for TriggerHandler {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        let trigger = invocation.context.get("trigger").cloned().unwrap_or(Value::Null);
        let params = invocation.params.as_object().filter(|p| !p.is_empty());

        Ok(match (trigger, params) {
            (trigger, None) => trigger,
            (Value::Object(mut payload), Some(params)) => {
                for (k, v) in params {
                    payload.insert(k.clone(), v.clone());
                }
                Value::Object(payload)
            }
            (other, Some(params)) => {
                let mut out = params.clone();
                out.insert("payload".into(), other);
                Value::Object(out)
            }
        })
    }

    fn name(&self) -> &str {
        "trigger"
    }
}

/// Evaluates a logic-condition node, returning `{"result": bool}`
///
/// Params are visible to the condition next to the context roots, so a node
/// can bind `"age": "{{ trigger.user.age }}"` and test the field `age`.
pub struct ConditionHandler;

#[async_trait]
impl StepHandler for ConditionHandler {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        let config = invocation.node.condition.as_ref().ok_or_else(|| {
            StepError::validation(format!("condition node '{}' has no condition", invocation.step_id))
        })?;

        let scope = condition_scope(invocation.context, &invocation.params);
        let result = evaluate(&config.when, &scope, config.mode)
            .map_err(|e| StepError::validation(e.to_string()))?;

        Ok(json!({ "result": result }))
    }

    fn name(&self) -> &str {
        "logic-condition"
    }
}

/// Context roots plus any params that don't shadow them
pub(crate) fn condition_scope(context: &Value, params: &Value) -> Value {
    let mut scope: Map<String, Value> = context.as_object().cloned().unwrap_or_default();
    if let Some(params) = params.as_object() {
        for (k, v) in params {
            scope.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Value::Object(scope)
}

/// Plans the iterations of a logic-loop node
///
/// Returns `{"items": [...] | null, "iterations": n}` where `n` never exceeds
/// `maxIterations`. A bound `items` param wins over the `items` path.
pub struct LoopHandler;

#[async_trait]
impl StepHandler for LoopHandler {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        let config = invocation.node.loop_config.as_ref().ok_or_else(|| {
            StepError::validation(format!("loop node '{}' has no loop block", invocation.step_id))
        })?;

        let items = match invocation.params.get("items") {
            Some(items) => Some(items.clone()),
            None => match config.items {
                Some(ref path) => Some(lookup(invocation.context, path).cloned().ok_or_else(|| {
                    StepError::validation(format!("loop items path '{}' not found", path))
                })?),
                None => None,
            },
        };

        match items {
            Some(Value::Array(items)) => {
                let iterations = items.len().min(config.max_iterations as usize);
                if items.len() > iterations {
                    tracing::warn!(
                        step = invocation.step_id,
                        items = items.len(),
                        max_iterations = config.max_iterations,
                        "Loop items exceed maxIterations, truncating"
                    );
                }
                Ok(json!({ "items": items, "iterations": iterations }))
            }
            Some(other) => Err(StepError::validation(format!(
                "loop items must be an array, got {}",
                other
            ))),
            None => Ok(json!({ "items": null, "iterations": config.max_iterations })),
        }
    }

    fn name(&self) -> &str {
        "logic-loop"
    }
}

/// Action that returns its params unchanged
pub struct PassthroughHandler;

#[async_trait]
impl StepHandler for PassthroughHandler {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        Ok(invocation.params.clone())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, EvaluationMode};
    use crate::config::{ConditionConfig, LoopConfig, NodeDefinition, NodeType};
    use crate::error::ErrorKind;

    fn condition_node(mode: EvaluationMode, when: Condition) -> NodeDefinition {
        let mut node = NodeDefinition::new(NodeType::LogicCondition);
        node.condition = Some(ConditionConfig { mode, when });
        node
    }

    fn loop_node(items: Option<&str>, max_iterations: u32) -> NodeDefinition {
        let mut node = NodeDefinition::new(NodeType::LogicLoop);
        node.loop_config = Some(LoopConfig {
            body: "body".into(),
            max_iterations,
            items: items.map(String::from),
            while_condition: None,
        });
        node
    }

    #[tokio::test]
    async fn test_trigger_merges_params() {
        let node = NodeDefinition::new(NodeType::Trigger);
        let ctx = json!({"trigger": {"subject": "hi", "from": "a"}});

        let out = TriggerHandler
            .handle(&Invocation::new("start", &node, json!({}), &ctx))
            .await
            .unwrap();
        assert_eq!(out, json!({"subject": "hi", "from": "a"}));

        let out = TriggerHandler
            .handle(&Invocation::new("start", &node, json!({"from": "b"}), &ctx))
            .await
            .unwrap();
        assert_eq!(out["from"], "b");
        assert_eq!(out["subject"], "hi");
    }

    #[tokio::test]
    async fn test_condition_handler_and_example() {
        let node = condition_node(
            EvaluationMode::Strict,
            Condition::all(vec![
                Condition::compare("gt", "age", json!(18)),
                Condition::compare("eq", "country", json!("US")),
            ]),
        );
        let ctx = json!({"trigger": {}});

        let out = ConditionHandler
            .handle(&Invocation::new(
                "check",
                &node,
                json!({"age": 20, "country": "US"}),
                &ctx,
            ))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": true}));

        let out = ConditionHandler
            .handle(&Invocation::new(
                "check",
                &node,
                json!({"age": 17, "country": "US"}),
                &ctx,
            ))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": false}));
    }

    #[tokio::test]
    async fn test_condition_strict_error_is_validation() {
        let node = condition_node(
            EvaluationMode::Strict,
            Condition::compare("eq", "steps.missing.label", json!("x")),
        );
        let ctx = json!({"steps": {}});
        let err = ConditionHandler
            .handle(&Invocation::new("check", &node, json!({}), &ctx))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Validation { .. }));

        let lenient = condition_node(
            EvaluationMode::Lenient,
            Condition::compare("eq", "steps.missing.label", json!("x")),
        );
        let out = ConditionHandler
            .handle(&Invocation::new("check", &lenient, json!({}), &ctx))
            .await
            .unwrap();
        assert_eq!(out["result"], false);
    }

    #[tokio::test]
    async fn test_loop_handler_items_capped() {
        let node = loop_node(Some("trigger.messages"), 2);
        let ctx = json!({"trigger": {"messages": ["a", "b", "c"]}});
        let out = LoopHandler
            .handle(&Invocation::new("each", &node, json!({}), &ctx))
            .await
            .unwrap();
        assert_eq!(out["iterations"], 2);
        assert_eq!(out["items"], json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_loop_handler_without_items() {
        let node = loop_node(None, 4);
        let ctx = json!({});
        let out = LoopHandler
            .handle(&Invocation::new("each", &node, json!({}), &ctx))
            .await
            .unwrap();
        assert_eq!(out, json!({"items": null, "iterations": 4}));
    }

    #[tokio::test]
    async fn test_loop_handler_rejects_non_array() {
        let node = loop_node(Some("trigger.count"), 4);
        let ctx = json!({"trigger": {"count": 3}});
        let err = LoopHandler
            .handle(&Invocation::new("each", &node, json!({}), &ctx))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_passthrough() {
        let node = NodeDefinition::new(NodeType::Action).with_action("passthrough");
        let ctx = json!({});
        let out = PassthroughHandler
            .handle(&Invocation::new("p", &node, json!({"x": 1}), &ctx))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }
}
