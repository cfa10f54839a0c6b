//! Step action invoker
//!
//! The walker dispatches every node through [`StepInvoker::invoke`]. The
//! default implementation, [`HandlerRegistry`], is a lookup table of
//! [`StepHandler`]s keyed by node type, with named action handlers taking
//! precedence for action nodes. Tests and embedders swap handlers freely.

mod builtin;
mod http_prompt;
mod registry;
mod schema;

pub use builtin::{ConditionHandler, LoopHandler, PassthroughHandler, TriggerHandler};
pub(crate) use builtin::condition_scope;
pub use http_prompt::HttpPromptHandler;
pub use registry::{HandlerRegistry, Invocation, StepHandler, StepInvoker};
pub use schema::validate_params;

use crate::config::{EngineConfig, NodeType};
use std::sync::Arc;

impl HandlerRegistry {
    /// Registry with the trigger, logic and `passthrough` handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(NodeType::Trigger, Arc::new(TriggerHandler))
            .register(NodeType::LogicCondition, Arc::new(ConditionHandler))
            .register(NodeType::LogicLoop, Arc::new(LoopHandler))
            .register_action("passthrough", Arc::new(PassthroughHandler));
        registry
    }

    /// Built-ins plus an ai-prompt handler for the configured providers
    pub fn from_config(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let mut registry = Self::with_builtins();
        if !config.providers.is_empty() {
            let handler = HttpPromptHandler::from_providers(&config.providers)?;
            registry.register(NodeType::AiPrompt, Arc::new(handler));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.has_handler(NodeType::Trigger, None));
        assert!(registry.has_handler(NodeType::LogicCondition, None));
        assert!(registry.has_handler(NodeType::LogicLoop, None));
        assert!(registry.has_handler(NodeType::Action, Some("passthrough")));
        assert!(!registry.has_handler(NodeType::Action, Some("send_email")));
        assert!(!registry.has_handler(NodeType::AiPrompt, None));
    }

    #[test]
    fn test_from_config_adds_prompt_handler() {
        let mut config = EngineConfig::default();
        config.providers.insert(
            "local".into(),
            ProviderConfig {
                base_url: "http://localhost:11434/v1".into(),
                ..Default::default()
            },
        );
        let registry = HandlerRegistry::from_config(&config).unwrap();
        assert!(registry.has_handler(NodeType::AiPrompt, Some("local")));
    }
}
