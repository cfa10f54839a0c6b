//! CLI command implementations
//!
//! Each command returns a process exit code; `Err` is reserved for failures
//! outside the run itself (unreadable files, a broken database).

use super::output::{
    OutputMode, create_sink, print_report, render_listing, render_run, render_step,
    render_summary,
};
use super::signals::{is_shutdown_requested, setup_signal_handlers};
use crate::config::{EngineConfig, StoreConfig, load_graph};
use crate::engine::{CancellationToken, EngineError, EventSink, ExecutionPlan, GraphWalker};
use crate::invoker::HandlerRegistry;
use crate::service::RunService;
use crate::state::{RunContext, RunStatus};
use crate::store::{RunStore, SqliteStore, StoreError};
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Arguments of `agent-flow run`
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub graph: PathBuf,
    /// Inline JSON, or `@path` to a JSON file
    pub input: Option<String>,
    pub workspace: Option<String>,
    pub user: Option<String>,
}

/// Open the run database: `--db`, then the configured path, then the default
pub fn open_store(db: Option<&Path>, config: &EngineConfig) -> Result<Arc<dyn RunStore>> {
    let path = match db {
        Some(p) => p.to_path_buf(),
        None => match config.store.resolved_path()? {
            Some(p) => p,
            None => StoreConfig::default_path()?,
        },
    };
    tracing::debug!(path = %path.display(), "Opening run store");
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening run store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_service(
    store: Arc<dyn RunStore>,
    config: &EngineConfig,
    sink: Arc<dyn EventSink>,
) -> Result<RunService> {
    let registry = HandlerRegistry::from_config(config).context("building AI provider clients")?;
    let walker = GraphWalker::new(Arc::new(registry), store)
        .with_config(config)
        .with_events(sink);
    Ok(RunService::new(walker))
}

/// Trigger payload from `--input`; `{}` when absent
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(json!({})),
        Some(raw) => {
            if let Some(path) = raw.strip_prefix('@') {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading input file {}", path))?;
                serde_json::from_str(&contents).with_context(|| format!("parsing input file {}", path))
            } else {
                serde_json::from_str(raw).context("parsing --input as JSON")
            }
        }
    }
}

/// Run a graph to completion
pub async fn run_graph(
    args: RunArgs,
    db: Option<&Path>,
    config: &EngineConfig,
    mode: OutputMode,
    debug: bool,
) -> Result<i32> {
    let graph = load_graph(&args.graph)?;
    let input = parse_input(args.input.as_deref())?;
    let store = open_store(db, config)?;
    let service = build_service(store, config, create_sink(mode, debug))?;

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(setup_signal_handlers(cancel.clone()));

    let context = RunContext::new(args.workspace, args.user);
    let result = service.execute(&graph, input, context, &cancel).await;
    signals.abort();

    let state = match result {
        Ok(state) => state,
        Err(EngineError::Graph(e)) => {
            eprintln!("✗ {}", e);
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    if state.status == RunStatus::Cancelled && is_shutdown_requested() {
        tracing::warn!(run_id = %state.run_id, "Run cancelled by signal; its trace is kept");
    }
    print_report(mode, &state, render_run);

    Ok(match state.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => 130,
        _ => 1,
    })
}

/// Validate a graph without running it
pub fn validate_graph(path: &Path, mode: OutputMode) -> Result<i32> {
    let graph = load_graph(path)?;

    match ExecutionPlan::compile(&graph) {
        Ok(plan) => {
            match mode {
                OutputMode::Console => {
                    println!("✓ Graph '{}' is valid ({} states)", graph.id, plan.len());
                    println!("  order: {}", plan.order().join(" → "));
                }
                OutputMode::Json => {
                    println!("{}", json!({"valid": true, "graph": graph.id, "order": plan.order()}));
                }
                OutputMode::Quiet => {}
            }
            Ok(0)
        }
        Err(e) => {
            match mode {
                OutputMode::Json => {
                    let problems: Vec<String> = e.problems.iter().map(|p| p.to_string()).collect();
                    println!("{}", json!({"valid": false, "graph": graph.id, "problems": problems}));
                }
                _ => eprintln!("✗ {}", e),
            }
            Ok(1)
        }
    }
}

/// Report on a stored run
pub fn show_summary(
    run_id: &str,
    db: Option<&Path>,
    config: &EngineConfig,
    mode: OutputMode,
) -> Result<i32> {
    let service = build_service(open_store(db, config)?, config, create_sink(OutputMode::Quiet, false))?;
    match service.get_summary(run_id) {
        Ok(summary) => {
            print_report(mode, &summary, render_summary);
            Ok(0)
        }
        Err(StoreError::NotFound { .. }) => {
            eprintln!("✗ No run '{}'", run_id);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

/// Every attempt of one step in a stored run
pub fn show_step(
    run_id: &str,
    step_id: &str,
    db: Option<&Path>,
    config: &EngineConfig,
    mode: OutputMode,
) -> Result<i32> {
    let service = build_service(open_store(db, config)?, config, create_sink(OutputMode::Quiet, false))?;
    match service.get_step_detail(run_id, step_id) {
        Ok(Some(detail)) => {
            print_report(mode, &detail, render_step);
            Ok(0)
        }
        Ok(None) => {
            eprintln!("✗ Step '{}' never ran in run '{}'", step_id, run_id);
            Ok(1)
        }
        Err(StoreError::NotFound { .. }) => {
            eprintln!("✗ No run '{}'", run_id);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

/// Most recent runs, newest first
pub fn list_runs(
    limit: usize,
    db: Option<&Path>,
    config: &EngineConfig,
    mode: OutputMode,
) -> Result<i32> {
    let service = build_service(open_store(db, config)?, config, create_sink(OutputMode::Quiet, false))?;
    let runs = service.list_runs(limit)?;
    print_report(mode, runs.as_slice(), render_listing);
    Ok(0)
}

/// Mark one error ledger entry as resolved
pub fn resolve_error(
    run_id: &str,
    error_id: &str,
    db: Option<&Path>,
    config: &EngineConfig,
) -> Result<i32> {
    let service = build_service(open_store(db, config)?, config, create_sink(OutputMode::Quiet, false))?;
    match service.resolve_error(run_id, error_id) {
        Ok(()) => Ok(0),
        Err(e @ (StoreError::NotFound { .. } | StoreError::UnknownError { .. })) => {
            eprintln!("✗ {}", e);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    const GREETING: &str = r#"{
        "id": "greeting",
        "startAt": "start",
        "states": {
            "start": {"type": "trigger", "next": "echo"},
            "echo": {"type": "action", "action": "passthrough", "input": {"to": "{{ trigger.name }}"}}
        }
    }"#;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(parse_input(Some(r#"{"a": 1}"#)).unwrap(), json!({"a": 1}));
        assert!(parse_input(Some("not json")).is_err());

        let dir = TempDir::new().unwrap();
        let path = write(&dir, "input.json", r#"{"name": "Ada"}"#);
        let raw = format!("@{}", path.display());
        assert_eq!(parse_input(Some(&raw)).unwrap(), json!({"name": "Ada"}));
    }

    #[test]
    fn test_validate_graph() {
        let dir = TempDir::new().unwrap();
        let ok = write(&dir, "ok.json", GREETING);
        assert_eq!(validate_graph(&ok, OutputMode::Quiet).unwrap(), 0);

        let cyclic = write(
            &dir,
            "cycle.toml",
            r#"
            id = "cycle"
            startAt = "a"

            [states.a]
            type = "trigger"
            next = "b"

            [states.b]
            type = "action"
            action = "passthrough"
            next = "a"
            "#,
        );
        assert_eq!(validate_graph(&cyclic, OutputMode::Quiet).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_then_inspect() {
        let dir = TempDir::new().unwrap();
        let graph = write(&dir, "greeting.json", GREETING);
        let db = dir.path().join("runs.db");
        let config = EngineConfig::default();

        let args = RunArgs {
            graph,
            input: Some(r#"{"name": "Ada"}"#.into()),
            workspace: Some("ws-1".into()),
            user: None,
        };
        let code = run_graph(args, Some(&db), &config, OutputMode::Quiet, false)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let store = open_store(Some(&db), &config).unwrap();
        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        let run_id = runs[0].run_id.clone();
        drop(store);

        assert_eq!(show_summary(&run_id, Some(&db), &config, OutputMode::Quiet).unwrap(), 0);
        assert_eq!(show_summary("nope", Some(&db), &config, OutputMode::Quiet).unwrap(), 1);
        assert_eq!(
            show_step(&run_id, "echo", Some(&db), &config, OutputMode::Quiet).unwrap(),
            0
        );
        assert_eq!(
            show_step(&run_id, "ghost", Some(&db), &config, OutputMode::Quiet).unwrap(),
            1
        );
        assert_eq!(list_runs(5, Some(&db), &config, OutputMode::Quiet).unwrap(), 0);
        assert_eq!(resolve_error(&run_id, "missing", Some(&db), &config).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_graph() {
        let dir = TempDir::new().unwrap();
        let graph = write(
            &dir,
            "bad.json",
            r#"{"id": "bad", "startAt": "missing", "states": {"a": {"type": "trigger"}}}"#,
        );
        let db = dir.path().join("runs.db");
        let config = EngineConfig::default();
        let args = RunArgs {
            graph,
            ..RunArgs::default()
        };

        let code = run_graph(args, Some(&db), &config, OutputMode::Quiet, false)
            .await
            .unwrap();
        assert_eq!(code, 1);
        assert!(open_store(Some(&db), &config).unwrap().list_runs(10).unwrap().is_empty());
    }
}
