//! Metrics derived from a run's trace

use super::run_state::{Metrics, StepDuration, StepStatus, StepTraceEntry};

/// Recompute run metrics from scratch
///
/// `completed_steps` counts entries that settled their step (completed or
/// failed); `retrying` entries only show up in `total_steps`.
pub fn compute_metrics(trace: &[StepTraceEntry]) -> Metrics {
    let settled: Vec<&StepTraceEntry> = trace.iter().filter(|e| e.status.is_final()).collect();

    let completed_steps = settled.len();
    let failed_steps = settled
        .iter()
        .filter(|e| e.status == StepStatus::Failed)
        .count();

    let success_rate = if completed_steps == 0 {
        0.0
    } else {
        (completed_steps - failed_steps) as f64 / completed_steps as f64 * 100.0
    };

    let total_duration: u64 = settled.iter().filter_map(|e| e.duration_ms).sum();
    let average_step_duration = if completed_steps == 0 {
        0.0
    } else {
        total_duration as f64 / completed_steps as f64
    };

    let mut steps_by_duration: Vec<StepDuration> = settled
        .iter()
        .map(|e| StepDuration {
            step_id: e.step_id.clone(),
            step_name: e.step_name.clone(),
            duration_ms: e.duration_ms.unwrap_or(0),
        })
        .collect();
    // stable: equal durations keep dispatch order
    steps_by_duration.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));

    Metrics {
        total_steps: trace.len(),
        completed_steps,
        failed_steps,
        success_rate,
        average_step_duration,
        total_duration,
        steps_by_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeType;
    use chrono::Duration;

    fn entry(id: &str, status: StepStatus, ms: i64) -> StepTraceEntry {
        let e = StepTraceEntry::started(id, id, NodeType::Action, 1);
        let end = e.start_time + Duration::milliseconds(ms);
        e.finish(status, end)
    }

    #[test]
    fn test_empty_trace() {
        let metrics = compute_metrics(&[]);
        assert_eq!(metrics.total_steps, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.average_step_duration, 0.0);
        assert!(metrics.steps_by_duration.is_empty());
    }

    #[test]
    fn test_three_of_four_succeeded() {
        let trace = vec![
            entry("a", StepStatus::Completed, 100),
            entry("b", StepStatus::Completed, 300),
            entry("c", StepStatus::Failed, 50),
            entry("d", StepStatus::Completed, 150),
        ];
        let metrics = compute_metrics(&trace);
        assert_eq!(metrics.completed_steps, 4);
        assert_eq!(metrics.failed_steps, 1);
        assert_eq!(metrics.success_rate, 75.0);
        assert_eq!(metrics.total_duration, 600);
        assert_eq!(metrics.average_step_duration, 150.0);
        let order: Vec<&str> = metrics
            .steps_by_duration
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_retrying_entries_not_settled() {
        let trace = vec![
            entry("a", StepStatus::Retrying, 10),
            entry("a", StepStatus::Retrying, 10),
            entry("a", StepStatus::Completed, 20),
        ];
        let metrics = compute_metrics(&trace);
        assert_eq!(metrics.total_steps, 3);
        assert_eq!(metrics.completed_steps, 1);
        assert_eq!(metrics.success_rate, 100.0);
        assert_eq!(metrics.total_duration, 20);
    }
}
