//! Graph and node definitions
//!
//! This is the document produced by the graph editor. It is validated here,
//! once, before a run is created.

use crate::condition::{Condition, EvaluationMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Node type - explicit, not inferred
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Entry point receiving the trigger payload
    Trigger,
    /// Call an AI model
    AiPrompt,
    /// Call an external action (connector)
    Action,
    /// Two-way branch on a condition
    LogicCondition,
    /// Bounded repetition of a body sub-graph
    LogicLoop,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::AiPrompt => "ai-prompt",
            NodeType::Action => "action",
            NodeType::LogicCondition => "logic-condition",
            NodeType::LogicLoop => "logic-loop",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing edges of a node
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Next {
    /// One successor
    Single(String),
    /// Fan-out, dispatched sequentially in this order
    FanOut(Vec<String>),
    /// Condition branches, keyed by outcome
    Branch {
        #[serde(rename = "true", default, skip_serializing_if = "Option::is_none")]
        on_true: Option<String>,
        #[serde(rename = "false", default, skip_serializing_if = "Option::is_none")]
        on_false: Option<String>,
    },
}

impl Next {
    /// Every node id this edge set can reach, in declared order
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Next::Single(id) => vec![id.as_str()],
            Next::FanOut(ids) => ids.iter().map(String::as_str).collect(),
            Next::Branch { on_true, on_false } => on_true
                .iter()
                .chain(on_false.iter())
                .map(String::as_str)
                .collect(),
        }
    }

    /// Target for a condition outcome
    pub fn branch(&self, outcome: bool) -> Option<&str> {
        match self {
            Next::Branch { on_true, on_false } => {
                if outcome {
                    on_true.as_deref()
                } else {
                    on_false.as_deref()
                }
            }
            _ => None,
        }
    }
}

/// Per-node retry override; unset fields fall back to engine defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub backoff_factor: Option<f64>,
    /// Milliseconds
    pub max_delay: Option<u64>,
    /// Milliseconds
    pub base_delay: Option<u64>,
}

/// Condition block of a logic-condition node
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    /// Required; never defaulted
    pub mode: EvaluationMode,
    pub when: Condition,
}

/// Loop block of a logic-loop node
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopConfig {
    /// Entry node of the body sub-graph
    pub body: String,

    /// Hard iteration cap; required
    pub max_iterations: u32,

    /// Dotted path to an array in the run context; one iteration per item
    pub items: Option<String>,

    /// Checked before every iteration
    #[serde(rename = "while")]
    pub while_condition: Option<ConditionConfig>,
}

/// Declared shape of a node's params
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InputSchema {
    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub prop_type: String,

    pub items: Option<Box<PropertySchema>>,
}

/// One node of the graph
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeDefinition {
    /// Must equal the map key when present
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default)]
    pub name: Option<String>,

    /// Action or provider name (action and ai-prompt nodes)
    pub action: Option<String>,

    /// Input bindings; string leaves may be templates
    #[serde(default)]
    pub input: Map<String, Value>,

    pub input_schema: Option<InputSchema>,

    pub next: Option<Next>,

    pub on_error: Option<String>,

    pub retry: Option<RetryOverride>,

    /// Milliseconds
    pub timeout: Option<u64>,

    pub condition: Option<ConditionConfig>,

    #[serde(rename = "loop")]
    pub loop_config: Option<LoopConfig>,
}

impl NodeDefinition {
    /// A node of the given type with nothing else set
    pub fn new(node_type: NodeType) -> Self {
        Self {
            id: None,
            node_type,
            name: None,
            action: None,
            input: Map::new(),
            input_schema: None,
            next: None,
            on_error: None,
            retry: None,
            timeout: None,
            condition: None,
            loop_config: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(Next::Single(next.into()));
        self
    }

    pub fn with_on_error(mut self, on_error: impl Into<String>) -> Self {
        self.on_error = Some(on_error.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Every outgoing reference: next targets, onError, loop body
    pub fn successors(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.next.iter().flat_map(|n| n.targets()).collect();
        if let Some(ref loop_config) = self.loop_config {
            out.push(&loop_config.body);
        }
        if let Some(ref on_error) = self.on_error {
            out.push(on_error);
        }
        out
    }
}

/// Full graph document
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: Option<u32>,

    pub start_at: String,

    /// Ordered by id so plans are deterministic
    pub states: BTreeMap<String, NodeDefinition>,
}

/// A single structural problem in a graph
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphProblem {
    #[error("graph has no states")]
    Empty,

    #[error("startAt references missing state '{start_at}'")]
    MissingStart { start_at: String },

    #[error("state '{key}' declares id '{id}'")]
    IdMismatch { key: String, id: String },

    #[error("state '{node}' {field} references missing state '{target}'")]
    UnknownReference {
        node: String,
        field: &'static str,
        target: String,
    },

    #[error("cycle detected involving state '{node}' (use a logic-loop node to repeat steps)")]
    Cycle { node: String },

    #[error("loop '{node}' body reaches '{target}', which also runs after the loop")]
    LoopBodyEscapes { node: String, target: String },

    #[error("loop '{node}' body state '{target}' is also entered from '{from}'")]
    LoopBodyEntered {
        node: String,
        from: String,
        target: String,
    },

    #[error("{node_type} state '{node}' is missing its '{field}' block")]
    MissingBlock {
        node: String,
        node_type: NodeType,
        field: &'static str,
    },

    #[error("state '{node}': {message}")]
    Invalid { node: String, message: String },
}

/// Graph rejected at compile time; the run never starts
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid graph '{graph_id}':\n  {}", .problems.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("\n  "))]
pub struct GraphDefinitionError {
    pub graph_id: String,
    pub problems: Vec<GraphProblem>,
}

impl GraphDefinition {
    /// Node lookup by id
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.states.get(id)
    }

    /// Display name for a node, falling back to its id
    pub fn node_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.states
            .get(id)
            .and_then(|n| n.name.as_deref())
            .unwrap_or(id)
    }

    /// Check referential integrity and per-type requirements
    ///
    /// Cycle detection happens when the graph is compiled into a plan.
    pub fn validate(&self) -> Result<(), GraphDefinitionError> {
        let mut problems = Vec::new();

        if self.states.is_empty() {
            problems.push(GraphProblem::Empty);
        }

        if !self.states.contains_key(&self.start_at) {
            problems.push(GraphProblem::MissingStart {
                start_at: self.start_at.clone(),
            });
        }

        let ids: HashSet<&str> = self.states.keys().map(String::as_str).collect();

        for (key, node) in &self.states {
            if let Some(ref id) = node.id {
                if id != key {
                    problems.push(GraphProblem::IdMismatch {
                        key: key.clone(),
                        id: id.clone(),
                    });
                }
            }

            let mut check = |field: &'static str, target: &str| {
                if !ids.contains(target) {
                    problems.push(GraphProblem::UnknownReference {
                        node: key.clone(),
                        field,
                        target: target.to_string(),
                    });
                }
            };

            if let Some(ref next) = node.next {
                for target in next.targets() {
                    check("next", target);
                }
            }
            if let Some(ref on_error) = node.on_error {
                check("onError", on_error);
            }
            if let Some(ref loop_config) = node.loop_config {
                check("loop.body", &loop_config.body);
            }

            self.validate_node_type(key, node, &mut problems);
        }

        self.validate_loop_bodies(&mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GraphDefinitionError {
                graph_id: self.id.clone(),
                problems,
            })
        }
    }

    /// A loop body must be a closed sub-graph: entered only through its loop
    /// node, and never reaching the loop's `next` or `onError` targets
    fn validate_loop_bodies(&self, problems: &mut Vec<GraphProblem>) {
        for (key, node) in &self.states {
            let Some(ref loop_config) = node.loop_config else {
                continue;
            };
            if !self.states.contains_key(&loop_config.body) {
                continue;
            }

            let body = self.reachable_from([loop_config.body.as_str()]);
            let after = self.reachable_from(
                node.next
                    .iter()
                    .flat_map(|n| n.targets())
                    .chain(node.on_error.as_deref()),
            );
            if let Some(target) = body.intersection(&after).next() {
                problems.push(GraphProblem::LoopBodyEscapes {
                    node: key.clone(),
                    target: target.to_string(),
                });
            }

            if body.contains(self.start_at.as_str()) {
                problems.push(GraphProblem::LoopBodyEntered {
                    node: key.clone(),
                    from: "startAt".to_string(),
                    target: self.start_at.clone(),
                });
            }
            for (from, other) in &self.states {
                if from == key || body.contains(from.as_str()) {
                    continue;
                }
                if let Some(target) = other.successors().into_iter().find(|t| body.contains(t)) {
                    problems.push(GraphProblem::LoopBodyEntered {
                        node: key.clone(),
                        from: from.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
    }

    /// Every state reachable from `roots` over all edges, roots included
    fn reachable_from<'a>(&'a self, roots: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some((key, node)) = self.states.get_key_value(id) else {
                continue;
            };
            if seen.insert(key.as_str()) {
                stack.extend(node.successors());
            }
        }
        seen
    }

    fn validate_node_type(&self, key: &str, node: &NodeDefinition, problems: &mut Vec<GraphProblem>) {
        let invalid = |message: &str| GraphProblem::Invalid {
            node: key.to_string(),
            message: message.to_string(),
        };

        let is_branch = matches!(node.next, Some(Next::Branch { .. }));

        match node.node_type {
            NodeType::LogicCondition => {
                if node.condition.is_none() {
                    problems.push(GraphProblem::MissingBlock {
                        node: key.to_string(),
                        node_type: node.node_type,
                        field: "condition",
                    });
                }
                if node.next.is_some() && !is_branch {
                    problems.push(invalid(
                        "logic-condition next must be a {\"true\": .., \"false\": ..} map",
                    ));
                }
            }
            NodeType::LogicLoop => match node.loop_config {
                None => problems.push(GraphProblem::MissingBlock {
                    node: key.to_string(),
                    node_type: node.node_type,
                    field: "loop",
                }),
                Some(ref loop_config) => {
                    if loop_config.max_iterations == 0 {
                        problems.push(invalid("loop maxIterations must be at least 1"));
                    }
                    if loop_config.body == key {
                        problems.push(invalid("loop body cannot be the loop node itself"));
                    }
                }
            },
            _ => {
                if is_branch {
                    problems.push(invalid("only logic-condition nodes may branch on true/false"));
                }
                if node.condition.is_some() || node.loop_config.is_some() {
                    problems.push(invalid(
                        "condition and loop blocks are only valid on logic nodes",
                    ));
                }
            }
        }

        if let Some(ref retry) = node.retry {
            if retry.max_attempts == Some(0) {
                problems.push(invalid("retry maxAttempts must be at least 1"));
            }
            if retry.backoff_factor.is_some_and(|f| f < 1.0 || !f.is_finite()) {
                problems.push(invalid("retry backoffFactor must be >= 1"));
            }
        }
        if node.timeout == Some(0) {
            problems.push(invalid("timeout must be greater than 0"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(value: Value) -> GraphDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_graph_json() {
        let g = graph(json!({
            "id": "triage",
            "name": "Inbox triage",
            "version": 2,
            "startAt": "start",
            "states": {
                "start": {"type": "trigger", "next": "classify"},
                "classify": {
                    "type": "ai-prompt",
                    "action": "openai",
                    "input": {"prompt": "Classify: {{ trigger.subject }}"},
                    "retry": {"maxAttempts": 5, "backoffFactor": 1.5, "maxDelay": 2000},
                    "timeout": 10000,
                    "next": ["route", "notify"],
                    "onError": "fallback"
                },
                "route": {
                    "type": "logic-condition",
                    "condition": {
                        "mode": "strict",
                        "when": {"operator": "eq", "field": "steps.classify.label", "value": "bill"}
                    },
                    "next": {"true": "notify", "false": "fallback"}
                },
                "notify": {"type": "action", "action": "passthrough"},
                "fallback": {"type": "action", "action": "passthrough"}
            }
        }));

        assert_eq!(g.start_at, "start");
        let classify = g.node("classify").unwrap();
        assert_eq!(classify.node_type, NodeType::AiPrompt);
        assert_eq!(
            classify.next,
            Some(Next::FanOut(vec!["route".into(), "notify".into()]))
        );
        assert_eq!(classify.retry.as_ref().unwrap().max_attempts, Some(5));
        let route = g.node("route").unwrap();
        assert_eq!(route.next.as_ref().unwrap().branch(true), Some("notify"));
        assert_eq!(route.next.as_ref().unwrap().branch(false), Some("fallback"));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_parse_graph_toml() {
        let g: GraphDefinition = toml::from_str(
            r#"
            id = "digest"
            startAt = "start"

            [states.start]
            type = "trigger"
            next = "each"

            [states.each]
            type = "logic-loop"
            loop = { body = "summarize", maxIterations = 10, items = "trigger.messages" }

            [states.summarize]
            type = "action"
            action = "passthrough"
            "#,
        )
        .unwrap();

        let each = g.node("each").unwrap();
        assert_eq!(each.loop_config.as_ref().unwrap().max_iterations, 10);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_missing_start() {
        let g = graph(json!({
            "id": "g",
            "startAt": "missing",
            "states": {"a": {"type": "trigger"}}
        }));
        let err = g.validate().unwrap_err();
        assert!(err.problems.contains(&GraphProblem::MissingStart {
            start_at: "missing".into()
        }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unknown_references() {
        let g = graph(json!({
            "id": "g",
            "startAt": "a",
            "states": {
                "a": {"type": "trigger", "next": ["b", "ghost"], "onError": "phantom"},
                "b": {"type": "action"}
            }
        }));
        let err = g.validate().unwrap_err();
        assert_eq!(err.problems.len(), 2);
        assert!(err.to_string().contains("ghost"));
        assert!(err.to_string().contains("phantom"));
    }

    #[test]
    fn test_loop_body_must_not_reach_continuation() {
        let g = graph(json!({
            "id": "g",
            "startAt": "each",
            "states": {
                "each": {
                    "type": "logic-loop",
                    "loop": {"body": "work", "maxIterations": 3},
                    "next": "done"
                },
                "work": {"type": "action", "action": "passthrough", "next": "done"},
                "done": {"type": "action", "action": "passthrough"}
            }
        }));
        let err = g.validate().unwrap_err();
        assert_eq!(
            err.problems,
            vec![GraphProblem::LoopBodyEscapes {
                node: "each".into(),
                target: "done".into()
            }]
        );
    }

    #[test]
    fn test_loop_body_entered_from_outside() {
        let g = graph(json!({
            "id": "g",
            "startAt": "start",
            "states": {
                "start": {"type": "trigger", "next": ["each", "tidy"]},
                "each": {
                    "type": "logic-loop",
                    "loop": {"body": "work", "maxIterations": 3}
                },
                "work": {"type": "action", "action": "passthrough", "next": "tidy"},
                "tidy": {"type": "action", "action": "passthrough"}
            }
        }));
        let err = g.validate().unwrap_err();
        assert_eq!(
            err.problems,
            vec![GraphProblem::LoopBodyEntered {
                node: "each".into(),
                from: "start".into(),
                target: "tidy".into()
            }]
        );
    }

    #[test]
    fn test_nested_loop_bodies_are_closed() {
        let g = graph(json!({
            "id": "g",
            "startAt": "outer",
            "states": {
                "outer": {
                    "type": "logic-loop",
                    "loop": {"body": "inner", "maxIterations": 2},
                    "next": "done"
                },
                "inner": {
                    "type": "logic-loop",
                    "loop": {"body": "work", "maxIterations": 2},
                    "next": "tally"
                },
                "work": {"type": "action", "action": "passthrough"},
                "tally": {"type": "action", "action": "passthrough"},
                "done": {"type": "action", "action": "passthrough"}
            }
        }));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_logic_nodes_need_blocks() {
        let g = graph(json!({
            "id": "g",
            "startAt": "a",
            "states": {
                "a": {"type": "logic-condition", "next": "b"},
                "b": {"type": "logic-loop"}
            }
        }));
        let err = g.validate().unwrap_err();
        assert!(err.problems.iter().any(|p| matches!(
            p,
            GraphProblem::MissingBlock { field: "condition", .. }
        )));
        assert!(err.problems.iter().any(|p| matches!(
            p,
            GraphProblem::MissingBlock { field: "loop", .. }
        )));
        assert!(err.problems.iter().any(|p| matches!(p, GraphProblem::Invalid { .. })));
    }

    #[test]
    fn test_condition_mode_is_required() {
        let result: Result<GraphDefinition, _> = serde_json::from_value(json!({
            "id": "g",
            "startAt": "a",
            "states": {
                "a": {
                    "type": "logic-condition",
                    "condition": {"when": {"operator": "eq", "field": "x", "value": 1}}
                }
            }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_retry_budget_rejected() {
        let g = graph(json!({
            "id": "g",
            "startAt": "a",
            "states": {"a": {"type": "action", "retry": {"maxAttempts": 0}}}
        }));
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_id_mismatch() {
        let g = graph(json!({
            "id": "g",
            "startAt": "a",
            "states": {"a": {"id": "b", "type": "trigger"}}
        }));
        let err = g.validate().unwrap_err();
        assert!(matches!(err.problems[0], GraphProblem::IdMismatch { .. }));
    }
}
