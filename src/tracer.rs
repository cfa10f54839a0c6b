//! Read-only reports over a run's trace and error ledger

use crate::state::{ErrorRecord, Metrics, RunState, RunStatus, StepDuration, StepStatus, StepTraceEntry};
use serde::Serialize;

const RECENT_ERRORS: usize = 5;
const RECENT_STEPS: usize = 10;
const SLOWEST_STEPS: usize = 5;

/// Overview of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    /// Rates and averages rounded to 2 decimals
    pub metrics: Metrics,
    /// Last five ledger entries, oldest first
    pub recent_errors: Vec<ErrorRecord>,
    /// Last ten trace entries, newest first
    pub recent_steps: Vec<StepTraceEntry>,
    pub slowest_steps: Vec<StepDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

/// Why a failed run failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub step_id: String,
    pub message: String,
    pub code: String,
    /// Attempts of the failing dispatch; earlier loop iterations not counted
    pub attempts: usize,
}

/// Every attempt of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDetail {
    pub step_id: String,
    pub step_name: String,
    pub attempts: Vec<StepTraceEntry>,
    pub errors: Vec<ErrorRecord>,
    /// Completed attempts over all attempts, percent
    pub success_rate: f64,
    /// Milliseconds, over attempts that finished
    pub average_duration: f64,
}

/// Summarize a run
pub fn summarize(state: &RunState) -> Summary {
    let mut metrics = state.metrics.clone();
    metrics.success_rate = round2(metrics.success_rate);
    metrics.average_step_duration = round2(metrics.average_step_duration);

    let skip = state.errors.len().saturating_sub(RECENT_ERRORS);
    let recent_errors = state.errors[skip..].to_vec();

    let mut recent_steps = state.trace.clone();
    // stable: entries started in the same instant stay newest first
    recent_steps.reverse();
    recent_steps.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    recent_steps.truncate(RECENT_STEPS);

    let slowest_steps = metrics
        .steps_by_duration
        .iter()
        .take(SLOWEST_STEPS)
        .cloned()
        .collect();

    let failure = if state.status == RunStatus::Failed {
        state.last_error().map(|last| FailureReport {
            step_id: last.step_id.clone(),
            message: last.error.message.clone(),
            code: last.error.code.clone(),
            attempts: failing_dispatch_attempts(state, &last.step_id),
        })
    } else {
        None
    };

    Summary {
        run_id: state.run_id.clone(),
        graph_id: state.graph_id.clone(),
        status: state.status,
        metrics,
        recent_errors,
        recent_steps,
        slowest_steps,
        failure,
    }
}

/// Attempts and errors of one step; `None` if the step never ran
pub fn step_detail(state: &RunState, step_id: &str) -> Option<StepDetail> {
    let attempts: Vec<StepTraceEntry> = state.attempts_of(step_id).cloned().collect();
    let errors: Vec<ErrorRecord> = state
        .errors
        .iter()
        .filter(|e| e.step_id == step_id)
        .cloned()
        .collect();
    if attempts.is_empty() && errors.is_empty() {
        return None;
    }

    let completed = attempts
        .iter()
        .filter(|e| e.status == StepStatus::Completed)
        .count();
    let success_rate = if attempts.is_empty() {
        0.0
    } else {
        completed as f64 / attempts.len() as f64 * 100.0
    };

    let durations: Vec<u64> = attempts.iter().filter_map(|e| e.duration_ms).collect();
    let average_duration = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    };

    let step_name = attempts
        .first()
        .map(|e| e.step_name.clone())
        .unwrap_or_else(|| step_id.to_string());

    Some(StepDetail {
        step_id: step_id.to_string(),
        step_name,
        attempts,
        errors,
        success_rate: round2(success_rate),
        average_duration: round2(average_duration),
    })
}

/// Length of the trailing retry chain of a step: its last entry plus the
/// `retrying` entries directly before it
fn failing_dispatch_attempts(state: &RunState, step_id: &str) -> usize {
    let mut entries = state.attempts_of(step_id).collect::<Vec<_>>().into_iter().rev();
    match entries.next() {
        None => 0,
        Some(_) => 1 + entries.take_while(|e| e.status == StepStatus::Retrying).count(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeType;
    use crate::error::StepError;
    use crate::state::{RunContext, RunStateDelta, merge};
    use chrono::Duration;
    use serde_json::json;

    fn entry(id: &str, attempt: u32, status: StepStatus, offset_ms: i64, ms: i64) -> StepTraceEntry {
        let mut e = StepTraceEntry::started(id, id, NodeType::Action, attempt);
        e.start_time += Duration::milliseconds(offset_ms);
        let end = e.start_time + Duration::milliseconds(ms);
        e.finish(status, end)
    }

    fn failed_run() -> RunState {
        let err = StepError::execution("smtp 503");
        let mut delta = RunStateDelta::new()
            .with_status(RunStatus::Failed)
            .with_trace(entry("fetch", 1, StepStatus::Completed, 0, 30))
            .with_trace(entry("send", 1, StepStatus::Retrying, 40, 10))
            .with_trace(entry("send", 2, StepStatus::Retrying, 60, 10))
            .with_trace(entry("send", 3, StepStatus::Failed, 80, 20));
        for attempt in 1..=3 {
            delta = delta.with_error(ErrorRecord::from_step_error("send", attempt, &err, json!({})));
        }
        merge(
            RunState::new("run-1", "mail", json!({}), RunContext::default()),
            delta,
        )
    }

    #[test]
    fn test_summary_of_failed_run() {
        let summary = summarize(&failed_run());

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.metrics.completed_steps, 2);
        assert_eq!(summary.metrics.success_rate, 50.0);
        assert_eq!(summary.recent_errors.len(), 3);
        assert_eq!(summary.recent_steps[0].attempt, 3);
        assert_eq!(summary.recent_steps.last().unwrap().step_id, "fetch");
        assert_eq!(summary.slowest_steps[0].step_id, "fetch");

        let failure = summary.failure.unwrap();
        assert_eq!(failure.step_id, "send");
        assert_eq!(failure.message, "smtp 503");
        assert_eq!(failure.code, "EXECUTION_ERROR");
        assert_eq!(failure.attempts, 3);
    }

    #[test]
    fn test_failure_counts_only_the_failing_iteration() {
        let err = StepError::execution("quota exceeded");
        let mut delta = RunStateDelta::new()
            .with_status(RunStatus::Failed)
            .with_trace(entry("each", 1, StepStatus::Completed, 0, 5));
        let attempts = [
            (1, StepStatus::Completed, 0),
            (2, StepStatus::Completed, 1),
            (3, StepStatus::Retrying, 2),
            (4, StepStatus::Failed, 2),
        ];
        for (attempt, status, iteration) in attempts {
            let mut e = entry("work", attempt, status, i64::from(attempt) * 10, 5);
            e.parent_step_id = Some("each".into());
            e.iteration = Some(iteration);
            delta = delta.with_trace(e);
        }
        for attempt in [3, 4] {
            delta = delta.with_error(ErrorRecord::from_step_error("work", attempt, &err, json!({})));
        }
        let state = merge(
            RunState::new("run-4", "digest", json!({}), RunContext::default()),
            delta,
        );

        let failure = summarize(&state).failure.unwrap();
        assert_eq!(failure.step_id, "work");
        assert_eq!(failure.attempts, 2);
        // step detail still shows the whole history
        assert_eq!(step_detail(&state, "work").unwrap().attempts.len(), 4);
    }

    #[test]
    fn test_summary_windows_are_bounded() {
        let mut delta = RunStateDelta::new().with_status(RunStatus::Completed);
        for i in 0..12 {
            let id = format!("s{}", i);
            delta = delta
                .with_trace(entry(&id, 1, StepStatus::Completed, i * 10, i + 1))
                .with_error(ErrorRecord::from_step_error(
                    &id,
                    1,
                    &StepError::execution("x"),
                    json!({}),
                ));
        }
        let state = merge(
            RunState::new("run-2", "g", json!({}), RunContext::default()),
            delta,
        );
        let summary = summarize(&state);

        assert_eq!(summary.recent_errors.len(), 5);
        assert_eq!(summary.recent_errors[0].step_id, "s7");
        assert_eq!(summary.recent_steps.len(), 10);
        assert_eq!(summary.recent_steps[0].step_id, "s11");
        assert_eq!(summary.slowest_steps.len(), 5);
        assert_eq!(summary.slowest_steps[0].step_id, "s11");
        assert!(summary.failure.is_none());
    }

    #[test]
    fn test_rates_rounded() {
        let delta = RunStateDelta::new()
            .with_trace(entry("a", 1, StepStatus::Completed, 0, 10))
            .with_trace(entry("b", 1, StepStatus::Completed, 0, 10))
            .with_trace(entry("c", 1, StepStatus::Failed, 0, 11));
        let state = merge(
            RunState::new("run-3", "g", json!({}), RunContext::default()),
            delta,
        );
        let summary = summarize(&state);
        assert_eq!(summary.metrics.success_rate, 66.67);
        assert_eq!(summary.metrics.average_step_duration, 10.33);
    }

    #[test]
    fn test_step_detail() {
        let state = failed_run();
        let detail = step_detail(&state, "send").unwrap();
        assert_eq!(detail.attempts.len(), 3);
        assert_eq!(detail.errors.len(), 3);
        assert_eq!(detail.success_rate, 0.0);
        assert!((detail.average_duration - 13.33).abs() < f64::EPSILON);

        let detail = step_detail(&state, "fetch").unwrap();
        assert_eq!(detail.success_rate, 100.0);
        assert_eq!(detail.average_duration, 30.0);

        assert!(step_detail(&state, "nope").is_none());
    }
}
