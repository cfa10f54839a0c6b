//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes. Each mode is an
//! [`EventSink`] for live run progress plus a renderer for finished reports.

use crate::engine::{EventSink, RunEvent};
use crate::state::{RunState, RunStatus};
use crate::store::RunListing;
use crate::tracer::{StepDetail, Summary};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Console output with status glyphs, written to stderr
pub struct ConsoleSink {
    debug: bool,
}

impl ConsoleSink {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }

    fn line(&self, event: &RunEvent) -> Option<String> {
        match event {
            RunEvent::RunStarted { graph_id, steps, run_id } => Some(format!(
                "Running graph '{}' ({} states, run {})",
                graph_id, steps, run_id
            )),
            RunEvent::StepStarted {
                step_name,
                attempt,
                iteration,
                ..
            } => {
                if !self.debug {
                    return None;
                }
                let mut line = format!("  → {} (attempt {})", step_name, attempt);
                if let Some(i) = iteration {
                    let _ = write!(line, " [iteration {}]", i);
                }
                Some(line)
            }
            RunEvent::StepRetrying {
                step_id,
                attempt,
                error,
                ..
            } => Some(format!("  ↻ {} attempt {} failed: {}", step_id, attempt, error)),
            RunEvent::StepCompleted {
                step_id,
                duration_ms,
                ..
            } => Some(format!(
                "  ✓ {} ({})",
                step_id,
                Self::format_duration(*duration_ms)
            )),
            RunEvent::StepFailed { step_id, error, .. } => {
                Some(format!("  ✗ {}: {}", step_id, error))
            }
            RunEvent::BranchSelected {
                step_id,
                outcome,
                target,
                ..
            } => Some(format!(
                "  {} is {} → {}",
                step_id,
                outcome,
                target.as_deref().unwrap_or("(end)")
            )),
            RunEvent::LoopIteration {
                step_id,
                index,
                total,
                ..
            } => Some(format!("  {} iteration {}/{}", step_id, index + 1, total)),
            RunEvent::RunFinished {
                status,
                duration_ms,
                steps_completed,
                ..
            } => {
                let glyph = if *status == RunStatus::Completed { "✓" } else { "✗" };
                Some(format!(
                    "\n{} Run {} ({} steps in {})",
                    glyph,
                    status,
                    steps_completed,
                    Self::format_duration(*duration_ms)
                ))
            }
        }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: &RunEvent) {
        if let Some(line) = self.line(event) {
            eprintln!("{}", line);
        }
    }
}

/// One JSON document per event on stdout
pub struct JsonSink;

impl EventSink for JsonSink {
    fn emit(&self, event: &RunEvent) {
        if let Ok(s) = serde_json::to_string(event) {
            println!("{}", s);
        }
    }
}

/// Emits nothing
pub struct QuietSink;

impl EventSink for QuietSink {
    fn emit(&self, _event: &RunEvent) {}
}

/// Create an event sink based on mode
pub fn create_sink(mode: OutputMode, debug: bool) -> Arc<dyn EventSink> {
    match mode {
        OutputMode::Console => Arc::new(ConsoleSink::new(debug)),
        OutputMode::Json => Arc::new(JsonSink),
        OutputMode::Quiet => Arc::new(QuietSink),
    }
}

/// Print a report in the chosen mode; quiet prints nothing
pub fn print_report<T: Serialize + ?Sized>(
    mode: OutputMode,
    value: &T,
    console: impl FnOnce(&T) -> String,
) {
    match mode {
        OutputMode::Console => print!("{}", console(value)),
        OutputMode::Json => match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => tracing::error!(error = %e, "Failed to serialize report"),
        },
        OutputMode::Quiet => {}
    }
}

pub fn render_run(state: &RunState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {} ({}): {}", state.run_id, state.graph_id, state.status);
    if let Some(last) = state.last_error() {
        let _ = writeln!(out, "last error in '{}': {}", last.step_id, last.error.message);
    }
    out
}

pub fn render_summary(summary: &Summary) -> String {
    let mut out = String::new();
    let m = &summary.metrics;
    let _ = writeln!(out, "Run {} ({})", summary.run_id, summary.graph_id);
    let _ = writeln!(out, "  status:        {}", summary.status);
    let _ = writeln!(
        out,
        "  steps:         {} settled, {} failed, {} trace entries",
        m.completed_steps, m.failed_steps, m.total_steps
    );
    let _ = writeln!(out, "  success rate:  {}%", m.success_rate);
    let _ = writeln!(
        out,
        "  duration:      {}ms total, {}ms average",
        m.total_duration, m.average_step_duration
    );

    if let Some(ref failure) = summary.failure {
        let _ = writeln!(
            out,
            "  failure:       {} [{}] after {} attempt(s): {}",
            failure.step_id, failure.code, failure.attempts, failure.message
        );
    }

    if !summary.slowest_steps.is_empty() {
        let _ = writeln!(out, "\nSlowest steps:");
        for step in &summary.slowest_steps {
            let _ = writeln!(out, "  {:<24} {}ms", step.step_name, step.duration_ms);
        }
    }

    if !summary.recent_steps.is_empty() {
        let _ = writeln!(out, "\nRecent steps:");
        for entry in &summary.recent_steps {
            let _ = writeln!(
                out,
                "  {} {:<24} #{} {}",
                entry.start_time.format("%H:%M:%S%.3f"),
                entry.step_id,
                entry.attempt,
                entry.status
            );
        }
    }

    if !summary.recent_errors.is_empty() {
        let _ = writeln!(out, "\nRecent errors:");
        for err in &summary.recent_errors {
            let resolved = if err.resolved { " (resolved)" } else { "" };
            let _ = writeln!(
                out,
                "  {} {} #{} {}: {}{}",
                err.id, err.step_id, err.attempt, err.error.code, err.error.message, resolved
            );
        }
    }
    out
}

pub fn render_step(detail: &StepDetail) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Step {} ({})", detail.step_id, detail.step_name);
    let _ = writeln!(
        out,
        "  {} attempt(s), {}% successful, {}ms average",
        detail.attempts.len(),
        detail.success_rate,
        detail.average_duration
    );
    for entry in &detail.attempts {
        let _ = write!(
            out,
            "  #{} {} {}ms",
            entry.attempt,
            entry.status,
            entry.duration_ms.unwrap_or(0)
        );
        if let Some(i) = entry.iteration {
            let _ = write!(out, " [iteration {}]", i);
        }
        if let Some(ref err) = entry.error {
            let _ = write!(out, " - {}", err);
        }
        out.push('\n');
    }
    out
}

pub fn render_listing(runs: &[RunListing]) -> String {
    if runs.is_empty() {
        return "(no runs)\n".to_string();
    }
    let mut out = String::new();
    for run in runs {
        let _ = writeln!(
            out,
            "{}  {:<10} {:<24} {}",
            run.run_id,
            run.status.as_str(),
            run.graph_id,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeType;
    use crate::state::{RunContext, RunStateDelta, StepStatus, StepTraceEntry, merge};
    use crate::tracer::summarize;
    use serde_json::json;

    #[test]
    fn test_console_format_duration() {
        assert_eq!(ConsoleSink::format_duration(500), "500ms");
        assert_eq!(ConsoleSink::format_duration(1000), "1.0s");
        assert_eq!(ConsoleSink::format_duration(2500), "2.5s");
    }

    #[test]
    fn test_console_hides_step_starts_unless_debug() {
        let event = RunEvent::StepStarted {
            run_id: "r".into(),
            step_id: "fetch".into(),
            step_name: "Fetch inbox".into(),
            node_type: NodeType::Action,
            attempt: 1,
            iteration: Some(2),
        };
        assert!(ConsoleSink::new(false).line(&event).is_none());
        let line = ConsoleSink::new(true).line(&event).unwrap();
        assert!(line.contains("Fetch inbox"));
        assert!(line.contains("iteration 2"));
    }

    #[test]
    fn test_console_branch_line() {
        let line = ConsoleSink::new(false)
            .line(&RunEvent::BranchSelected {
                run_id: "r".into(),
                step_id: "check".into(),
                outcome: true,
                target: None,
            })
            .unwrap();
        assert!(line.contains("check is true"));
        assert!(line.contains("(end)"));
    }

    #[test]
    fn test_render_summary_lists_failure() {
        let entry = StepTraceEntry::started("send", "Send mail", NodeType::Action, 1);
        let end = entry.start_time;
        let state = merge(
            RunState::new("run-1", "mail", json!({}), RunContext::default()),
            RunStateDelta::new()
                .with_status(RunStatus::Failed)
                .with_trace(entry.finish(StepStatus::Failed, end)),
        );
        let text = render_summary(&summarize(&state));
        assert!(text.contains("Run run-1 (mail)"));
        assert!(text.contains("status:        failed"));
        assert!(text.contains("Send mail"));
    }

    #[test]
    fn test_render_empty_listing() {
        assert_eq!(render_listing(&[]), "(no runs)\n");
    }

    #[test]
    fn test_create_sink() {
        let _ = create_sink(OutputMode::Console, false);
        let _ = create_sink(OutputMode::Json, false);
        let _ = create_sink(OutputMode::Quiet, false);
    }
}
