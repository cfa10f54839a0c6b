//! Run events emitted while a graph is walked

use crate::config::NodeType;
use crate::state::RunStatus;
use serde::Serialize;

/// Progress of a run, in dispatch order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        graph_id: String,
        steps: usize,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        step_name: String,
        node_type: NodeType,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    StepRetrying {
        run_id: String,
        step_id: String,
        attempt: u32,
        error: String,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        attempt: u32,
        error: String,
    },
    BranchSelected {
        run_id: String,
        step_id: String,
        outcome: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    LoopIteration {
        run_id: String,
        step_id: String,
        index: u32,
        total: u32,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        duration_ms: u64,
        steps_completed: usize,
    },
}

/// Receives run events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Sink that drops every event
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &RunEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = RunEvent::BranchSelected {
            run_id: "r".into(),
            step_id: "check".into(),
            outcome: false,
            target: Some("reject".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "branch_selected");
        assert_eq!(value["target"], "reject");
    }
}
