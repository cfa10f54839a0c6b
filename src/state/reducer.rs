//! State channel reducer
//!
//! Every change to a [`RunState`] goes through [`merge`]. Each field has one
//! fixed strategy, listed in [`CHANNELS`].

use super::metrics::compute_metrics;
use super::run_state::{ErrorRecord, RunState, RunStatus, StepTraceEntry};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// How a field of the run state absorbs a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Previous entries first, delta entries after
    Append,
    /// Delta value wins when set
    Overwrite,
    /// Delta keys win, other keys are kept
    KeyedOverwrite,
    /// Sets a flag on existing entries, never removes any
    Resolve,
    /// Derived from the merged state
    Recompute,
}

/// Field name to merge strategy
pub const CHANNELS: &[(&str, MergeStrategy)] = &[
    ("trace", MergeStrategy::Append),
    ("errors", MergeStrategy::Append),
    ("messages", MergeStrategy::Append),
    ("agentState", MergeStrategy::KeyedOverwrite),
    ("status", MergeStrategy::Overwrite),
    ("context.updatedAt", MergeStrategy::Overwrite),
    ("resolvedErrors", MergeStrategy::Resolve),
    ("metrics", MergeStrategy::Recompute),
];

/// Strategy for a field, if the field is a channel
pub fn strategy_for(field: &str) -> Option<MergeStrategy> {
    CHANNELS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, strategy)| *strategy)
}

/// A partial update to a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStateDelta {
    pub status: Option<RunStatus>,
    pub updated_at: Option<DateTime<Utc>>,
    pub trace: Vec<StepTraceEntry>,
    pub errors: Vec<ErrorRecord>,
    pub messages: Vec<Value>,
    pub agent_state: Map<String, Value>,
    /// Error ids whose `resolved` flag is set
    pub resolved_errors: Vec<String>,
}

impl RunStateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn with_trace(mut self, entry: StepTraceEntry) -> Self {
        self.trace.push(entry);
        self
    }

    pub fn with_error(mut self, record: ErrorRecord) -> Self {
        self.errors.push(record);
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_agent_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.agent_state.insert(key.into(), value);
        self
    }

    pub fn resolving(mut self, error_id: impl Into<String>) -> Self {
        self.resolved_errors.push(error_id.into());
        self
    }

    /// Fold `later` into `self` so that applying the result equals applying
    /// `self` then `later`
    pub fn combine(mut self, later: RunStateDelta) -> Self {
        overwrite(&mut self.status, later.status.map(Some));
        overwrite(&mut self.updated_at, later.updated_at.map(Some));
        append(&mut self.trace, later.trace);
        append(&mut self.errors, later.errors);
        append(&mut self.messages, later.messages);
        keyed_overwrite(&mut self.agent_state, later.agent_state);
        append(&mut self.resolved_errors, later.resolved_errors);
        self
    }
}

/// Apply a delta to a run state
///
/// Appended errors are in the ledger before resolutions are applied, so a
/// delta may add an error and resolve it at once. A resolution naming an
/// unknown id is ignored.
pub fn merge(previous: RunState, delta: RunStateDelta) -> RunState {
    if delta.is_empty() {
        return previous;
    }

    let mut next = previous;
    overwrite(&mut next.status, delta.status);
    overwrite(&mut next.context.updated_at, delta.updated_at);
    append(&mut next.trace, delta.trace);
    append(&mut next.errors, delta.errors);
    append(&mut next.messages, delta.messages);
    keyed_overwrite(&mut next.agent_state, delta.agent_state);

    for id in &delta.resolved_errors {
        if let Some(record) = next.errors.iter_mut().find(|e| &e.id == id) {
            record.resolved = true;
        }
    }

    next.metrics = compute_metrics(&next.trace);
    next
}

fn append<T>(channel: &mut Vec<T>, new: Vec<T>) {
    channel.extend(new);
}

fn overwrite<T>(slot: &mut T, new: Option<T>) {
    if let Some(value) = new {
        *slot = value;
    }
}

fn keyed_overwrite(map: &mut Map<String, Value>, new: Map<String, Value>) {
    for (key, value) in new {
        map.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeType;
    use crate::error::StepError;
    use crate::state::{RunContext, StepStatus};
    use chrono::Duration;
    use serde_json::json;

    fn base() -> RunState {
        RunState::new("run-1", "triage", json!({"subject": "hi"}), RunContext::default())
    }

    fn settled(id: &str, status: StepStatus, ms: i64) -> StepTraceEntry {
        let e = StepTraceEntry::started(id, id, NodeType::Action, 1);
        let end = e.start_time + Duration::milliseconds(ms);
        e.finish(status, end)
    }

    #[test]
    fn test_history_channels_are_append_only() {
        assert_eq!(strategy_for("trace"), Some(MergeStrategy::Append));
        assert_eq!(strategy_for("errors"), Some(MergeStrategy::Append));
        assert_eq!(strategy_for("metrics"), Some(MergeStrategy::Recompute));
        assert_eq!(strategy_for("runId"), None);
    }

    #[test]
    fn test_empty_delta_is_identity() {
        let state = merge(
            base(),
            RunStateDelta::new()
                .with_status(RunStatus::Running)
                .with_trace(settled("a", StepStatus::Completed, 10)),
        );
        assert_eq!(merge(state.clone(), RunStateDelta::new()), state);
    }

    #[test]
    fn test_trace_and_errors_only_grow() {
        let err = StepError::execution("boom");
        let mut state = base();
        let mut previous_trace = 0;
        let mut previous_errors = 0;

        for i in 0..4 {
            let mut delta = RunStateDelta::new().with_trace(settled("a", StepStatus::Failed, 5));
            if i % 2 == 0 {
                delta = delta.with_error(ErrorRecord::from_step_error("a", i + 1, &err, json!({})));
            }
            state = merge(state, delta);

            assert!(state.trace.len() > previous_trace);
            assert!(state.errors.len() >= previous_errors);
            previous_trace = state.trace.len();
            previous_errors = state.errors.len();
        }
        assert_eq!(state.trace.len(), 4);
        assert_eq!(state.errors.len(), 2);
    }

    #[test]
    fn test_scalars_overwritten_only_when_set() {
        let state = merge(base(), RunStateDelta::new().with_status(RunStatus::Running));
        let state = merge(state, RunStateDelta::new().with_message(json!({"role": "user"})));
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.messages.len(), 1);

        let later = Utc::now() + Duration::seconds(5);
        let state = merge(state, RunStateDelta::new().touched(later));
        assert_eq!(state.context.updated_at, later);
        assert_eq!(state.status, RunStatus::Running);
    }

    #[test]
    fn test_agent_state_keyed_overwrite() {
        let state = merge(
            base(),
            RunStateDelta::new()
                .with_agent_state("fetch", json!({"count": 1}))
                .with_agent_state("label", json!("spam")),
        );
        let state = merge(
            state,
            RunStateDelta::new().with_agent_state("fetch", json!({"count": 2})),
        );
        assert_eq!(state.agent_state["fetch"], json!({"count": 2}));
        assert_eq!(state.agent_state["label"], json!("spam"));
    }

    #[test]
    fn test_metrics_recomputed_on_merge() {
        let delta = RunStateDelta::new()
            .with_trace(settled("a", StepStatus::Completed, 10))
            .with_trace(settled("b", StepStatus::Completed, 10))
            .with_trace(settled("c", StepStatus::Failed, 10))
            .with_trace(settled("d", StepStatus::Completed, 10));
        let state = merge(base(), delta);
        assert_eq!(state.metrics.completed_steps, 4);
        assert_eq!(state.metrics.failed_steps, 1);
        assert_eq!(state.metrics.success_rate, 75.0);
    }

    #[test]
    fn test_resolution_flips_flag_without_removing() {
        let record = ErrorRecord::from_step_error("a", 1, &StepError::execution("x"), json!({}));
        let id = record.id.clone();
        let state = merge(base(), RunStateDelta::new().with_error(record));
        assert!(!state.errors[0].resolved);

        let state = merge(state, RunStateDelta::new().resolving(id).resolving("unknown"));
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].resolved);
    }

    #[test]
    fn test_combine_is_associative_with_merge() {
        let record = ErrorRecord::from_step_error("b", 1, &StepError::execution("x"), json!({}));
        let first = RunStateDelta::new()
            .with_status(RunStatus::Running)
            .with_trace(settled("a", StepStatus::Completed, 10))
            .with_agent_state("a", json!(1))
            .with_error(record.clone());
        let second = RunStateDelta::new()
            .with_trace(settled("b", StepStatus::Failed, 20))
            .with_agent_state("a", json!(2))
            .with_message(json!("note"))
            .resolving(record.id.clone());
        let third = RunStateDelta::new().with_status(RunStatus::Failed);

        let stepwise = merge(merge(merge(base(), first.clone()), second.clone()), third.clone());
        let left = merge(base(), first.clone().combine(second.clone()).combine(third.clone()));
        let right = merge(base(), first.combine(second.combine(third)));

        assert_eq!(stepwise, left);
        assert_eq!(stepwise, right);
        assert_eq!(stepwise.status, RunStatus::Failed);
        assert_eq!(stepwise.agent_state["a"], json!(2));
        assert!(stepwise.errors[0].resolved);
    }
}
