//! Run state and its trace, error and metric records

use crate::config::NodeType;
use crate::error::StepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Status of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Retrying,
}

impl StepStatus {
    /// The attempt is over and another one follows, or it settled the step
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::Started)
    }

    /// Settled the step: counted by the run metrics
    pub fn is_final(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "retrying" => Ok(StepStatus::Retrying),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Who started the run and when it last changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(workspace_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            workspace_id,
            user_id,
            updated_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One attempt of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTraceEntry {
    pub step_id: String,
    pub step_name: String,
    pub node_type: NodeType,

    /// Run-wide attempt number for this step id, starting at 1
    pub attempt: u32,

    /// Enclosing logic-loop node for loop body steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,

    /// Loop iteration index (0-based) for loop body steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub status: StepStatus,

    /// Set together with `end_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepTraceEntry {
    /// A freshly dispatched attempt
    pub fn started(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        node_type: NodeType,
        attempt: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            node_type,
            attempt,
            parent_step_id: None,
            iteration: None,
            start_time: Utc::now(),
            end_time: None,
            status: StepStatus::Started,
            duration_ms: None,
            input: None,
            output: None,
            error: None,
        }
    }

    pub fn with_parent(mut self, parent_step_id: impl Into<String>, iteration: u32) -> Self {
        self.parent_step_id = Some(parent_step_id.into());
        self.iteration = Some(iteration);
        self
    }

    /// Move a started entry to its terminal status
    pub fn finish(mut self, status: StepStatus, end_time: DateTime<Utc>) -> Self {
        debug_assert!(status.is_finished());
        let duration = (end_time - self.start_time).num_milliseconds().max(0) as u64;
        self.status = status;
        self.end_time = Some(end_time);
        self.duration_ms = Some(duration);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Error payload of a ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// An entry of the run's error ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub step_id: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,

    /// Evaluation context at the time of failure
    pub context: Value,

    pub resolved: bool,
}

impl ErrorRecord {
    /// Record a failed attempt
    pub fn from_step_error(
        step_id: impl Into<String>,
        attempt: u32,
        err: &StepError,
        context: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            attempt,
            timestamp: Utc::now(),
            error: ErrorDetail {
                message: err.message(),
                code: err.kind.code().to_string(),
                stack: err.stack(),
            },
            context,
            resolved: false,
        }
    }
}

/// A settled step and how long it took
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDuration {
    pub step_id: String,
    pub step_name: String,
    pub duration_ms: u64,
}

/// Aggregates derived from the trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    /// Percent
    pub success_rate: f64,
    /// Milliseconds
    pub average_step_duration: f64,
    /// Milliseconds
    pub total_duration: u64,
    pub steps_by_duration: Vec<StepDuration>,
}

/// Everything known about one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub context: RunContext,

    /// Trigger payload
    pub input: Value,

    pub messages: Vec<Value>,

    /// Outputs of successful steps, keyed by step id
    pub agent_state: Map<String, Value>,

    pub metrics: Metrics,
    pub errors: Vec<ErrorRecord>,
    pub trace: Vec<StepTraceEntry>,
}

impl RunState {
    /// A pending run with an empty trace
    pub fn new(
        run_id: impl Into<String>,
        graph_id: impl Into<String>,
        input: Value,
        context: RunContext,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            status: RunStatus::Pending,
            context,
            input,
            messages: Vec::new(),
            agent_state: Map::new(),
            metrics: Metrics::default(),
            errors: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// Most recent unresolved error, falling back to the most recent one
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors
            .iter()
            .rev()
            .find(|e| !e.resolved)
            .or_else(|| self.errors.last())
    }

    /// All trace entries of one step, in dispatch order
    pub fn attempts_of<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepTraceEntry> + 'a {
        self.trace.iter().filter(move |e| e.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_finish_sets_end_and_duration_together() {
        let entry = StepTraceEntry::started("fetch", "Fetch inbox", NodeType::Action, 1);
        assert!(entry.end_time.is_none());
        assert!(entry.duration_ms.is_none());

        let end = entry.start_time + Duration::milliseconds(250);
        let entry = entry.finish(StepStatus::Completed, end);
        assert_eq!(entry.end_time, Some(end));
        assert_eq!(entry.duration_ms, Some(250));
        assert_eq!(entry.status, StepStatus::Completed);
    }

    #[test]
    fn test_trace_entry_json_shape() {
        let entry = StepTraceEntry::started("summarize", "summarize", NodeType::AiPrompt, 2)
            .with_parent("each", 1);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["stepId"], "summarize");
        assert_eq!(value["nodeType"], "ai-prompt");
        assert_eq!(value["parentStepId"], "each");
        assert_eq!(value["iteration"], 1);
        assert_eq!(value["status"], "started");
        assert!(value.get("endTime").is_none());
    }

    #[test]
    fn test_error_record_from_step_error() {
        let err = StepError::execution("smtp 503").with_step("send");
        let record = ErrorRecord::from_step_error("send", 2, &err, json!({"trigger": {}}));
        assert_eq!(record.error.code, "EXECUTION_ERROR");
        assert_eq!(record.error.message, "smtp 503");
        assert_eq!(record.attempt, 2);
        assert!(!record.resolved);
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
    }
}
