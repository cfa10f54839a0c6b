//! Configuration types and loading for agent-flow

mod graph;
mod loader;
mod provider;

pub use graph::{
    ConditionConfig, GraphDefinition, GraphDefinitionError, GraphProblem, InputSchema, LoopConfig,
    Next, NodeDefinition, NodeType, PropertySchema, RetryOverride,
};
pub use loader::{CaptureConfig, Defaults, EngineConfig, StoreConfig, load_graph};
pub use provider::ProviderConfig;
