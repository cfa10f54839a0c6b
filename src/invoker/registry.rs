//! Handler trait and the node-type lookup table

use super::schema::validate_params;
use crate::config::{NodeDefinition, NodeType};
use crate::error::StepError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One call of a step handler
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub step_id: &'a str,
    pub node_type: NodeType,
    /// Action or provider name from the node
    pub action: Option<&'a str>,
    /// Rendered input bindings
    pub params: Value,
    /// Evaluation context (`trigger`, `steps`, `run`, `loop`)
    pub context: &'a Value,
    pub node: &'a NodeDefinition,
}

impl<'a> Invocation<'a> {
    pub fn new(step_id: &'a str, node: &'a NodeDefinition, params: Value, context: &'a Value) -> Self {
        Self {
            step_id,
            node_type: node.node_type,
            action: node.action.as_deref(),
            params,
            context,
            node,
        }
    }
}

/// Executes one kind of step
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError>;

    /// Handler name, for logs
    fn name(&self) -> &str;
}

#[async_trait]
impl StepHandler for Box<dyn StepHandler> {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        (**self).handle(invocation).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// The walker's only view of step execution
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Value, StepError>;
}

/// Handlers keyed by node type, plus named action handlers
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    by_type: HashMap<NodeType, Arc<dyn StepHandler>>,
    by_action: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a node type, replacing any previous one
    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn StepHandler>) -> &mut Self {
        tracing::debug!(node_type = %node_type, handler = handler.name(), "Registered step handler");
        self.by_type.insert(node_type, handler);
        self
    }

    /// Register a handler for action nodes naming `action`
    ///
    /// Named actions win over the generic action handler.
    pub fn register_action(
        &mut self,
        action: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> &mut Self {
        let action = action.into();
        tracing::debug!(action = %action, handler = handler.name(), "Registered action handler");
        self.by_action.insert(action, handler);
        self
    }

    /// Whether a node could be dispatched
    pub fn has_handler(&self, node_type: NodeType, action: Option<&str>) -> bool {
        self.resolve(node_type, action).is_some()
    }

    fn resolve(&self, node_type: NodeType, action: Option<&str>) -> Option<&Arc<dyn StepHandler>> {
        if node_type == NodeType::Action {
            if let Some(handler) = action.and_then(|a| self.by_action.get(a)) {
                return Some(handler);
            }
        }
        self.by_type.get(&node_type)
    }
}

#[async_trait]
impl StepInvoker for HandlerRegistry {
    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        if let Some(ref schema) = invocation.node.input_schema {
            validate_params(schema, &invocation.params)?;
        }

        let handler = self
            .resolve(invocation.node_type, invocation.action)
            .ok_or_else(|| {
                StepError::validation(match invocation.action {
                    Some(action) => format!(
                        "no handler registered for {} node (action '{}')",
                        invocation.node_type, action
                    ),
                    None => format!("no handler registered for {} node", invocation.node_type),
                })
            })?;

        tracing::trace!(step = invocation.step_id, handler = handler.name(), "Invoking handler");
        handler.handle(invocation).await
    }
}
