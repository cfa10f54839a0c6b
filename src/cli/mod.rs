//! CLI module for agent-flow
//!
//! This module provides:
//! - Command implementations (run, validate, summary, step, runs, resolve)
//! - Output sinks (console, JSON, quiet)
//! - Signal handling for graceful shutdown
//!
//! # Example
//!
//! ```ignore
//! use agent_flow::cli::{commands, output::OutputMode};
//!
//! let args = commands::RunArgs { graph: "triage.json".into(), ..Default::default() };
//! let exit_code = commands::run_graph(args, None, &config, OutputMode::Console, false).await?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{
    RunArgs, list_runs, open_store, parse_input, resolve_error, run_graph, show_step,
    show_summary, validate_graph,
};
pub use output::{ConsoleSink, JsonSink, OutputMode, QuietSink, create_sink};
pub use signals::{is_shutdown_requested, setup_signal_handlers};
