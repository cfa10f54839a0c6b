//! Graph compilation into a dispatch order

use crate::config::{GraphDefinition, GraphDefinitionError, GraphProblem};
use std::collections::{HashMap, HashSet, VecDeque};

/// A validated graph in topological order
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<String>,
    position: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Validate the graph and order its nodes
    ///
    /// Uses Kahn's algorithm over every edge kind. The queue is seeded with
    /// `startAt`, then the remaining roots by id; successors enter in their
    /// declared order, so fan-out targets keep the order they were listed in.
    pub fn compile(graph: &GraphDefinition) -> Result<Self, GraphDefinitionError> {
        graph.validate()?;

        let mut in_degree: HashMap<&str, usize> =
            graph.states.keys().map(|id| (id.as_str(), 0)).collect();
        for node in graph.states.values() {
            for target in node.successors() {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = VecDeque::new();
        if in_degree.get(graph.start_at.as_str()) == Some(&0) {
            queue.push_back(graph.start_at.as_str());
        }
        for id in graph.states.keys() {
            if id != &graph.start_at && in_degree[id.as_str()] == 0 {
                queue.push_back(id);
            }
        }

        let mut order = Vec::with_capacity(graph.states.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            let Some(node) = graph.node(id) else {
                continue;
            };
            for target in node.successors() {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if order.len() < graph.states.len() {
            let remaining: HashSet<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(GraphDefinitionError {
                graph_id: graph.id.clone(),
                problems: vec![GraphProblem::Cycle {
                    node: node_on_cycle(graph, &remaining),
                }],
            });
        }

        let position = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        tracing::debug!(graph = %graph.id, order = ?order, "Compiled execution plan");
        Ok(Self { order, position })
    }

    /// Node ids in dispatch order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.position.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Every node left over by Kahn's algorithm has a leftover predecessor, so
/// walking predecessors must revisit a node, and that node is on a cycle
fn node_on_cycle(graph: &GraphDefinition, remaining: &HashSet<&str>) -> String {
    let mut predecessors: HashMap<&str, &str> = HashMap::new();
    for (id, node) in &graph.states {
        if !remaining.contains(id.as_str()) {
            continue;
        }
        for target in node.successors() {
            if remaining.contains(target) {
                predecessors.entry(target).or_insert(id.as_str());
            }
        }
    }

    let Some(mut current) = graph
        .states
        .keys()
        .map(String::as_str)
        .find(|id| remaining.contains(id))
    else {
        return graph.start_at.clone();
    };

    let mut seen = HashSet::new();
    while seen.insert(current) {
        match predecessors.get(current) {
            Some(&prev) => current = prev,
            None => break,
        }
    }
    current.to_string()
}
