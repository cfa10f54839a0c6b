use agent_flow::cli::{OutputMode, RunArgs, commands};
use agent_flow::config::EngineConfig;
use agent_flow::logging;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agent-flow")]
#[command(about = "Run agent workflow graphs with retries, traces and metrics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory holding .agent-flow/config.toml (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Run database (overrides the configured store path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputMode::Console)]
    output: OutputMode,

    /// Also write JSON logs to a file; without a value, under the config dir
    #[arg(long, global = true, num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph
    Run {
        /// Graph document (.json or .toml)
        graph: PathBuf,

        /// Trigger payload as JSON, or @file
        #[arg(long)]
        input: Option<String>,

        /// Workspace the run belongs to
        #[arg(long)]
        workspace: Option<String>,

        /// User who started the run
        #[arg(long)]
        user: Option<String>,
    },

    /// Validate a graph without running it
    Validate {
        /// Graph document (.json or .toml)
        graph: PathBuf,
    },

    /// Summarize a stored run
    Summary { run_id: String },

    /// Show every attempt of one step
    Step { run_id: String, step_id: String },

    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Mark an error ledger entry as resolved
    Resolve { run_id: String, error_id: String },
}

impl Commands {
    fn log_name(&self) -> &'static str {
        match self {
            Commands::Run { .. } => "run",
            Commands::Validate { .. } => "validate",
            Commands::Summary { .. } => "summary",
            Commands::Step { .. } => "step",
            Commands::Runs { .. } => "runs",
            Commands::Resolve { .. } => "resolve",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match cli.log_file {
        Some(Some(path)) => Some(path),
        Some(None) => Some(logging::default_log_path(cli.command.log_name())?),
        None => None,
    };
    let guard = logging::init_logging(cli.debug, cli.quiet, log_file)?;

    let config = EngineConfig::load(cli.dir.as_deref())?;
    let mode = if cli.quiet { OutputMode::Quiet } else { cli.output };
    let db = cli.db.as_deref();

    let code = match cli.command {
        Commands::Run {
            graph,
            input,
            workspace,
            user,
        } => {
            let args = RunArgs {
                graph,
                input,
                workspace,
                user,
            };
            commands::run_graph(args, db, &config, mode, cli.debug).await?
        }
        Commands::Validate { graph } => commands::validate_graph(&graph, mode)?,
        Commands::Summary { run_id } => commands::show_summary(&run_id, db, &config, mode)?,
        Commands::Step { run_id, step_id } => {
            commands::show_step(&run_id, &step_id, db, &config, mode)?
        }
        Commands::Runs { limit } => commands::list_runs(limit, db, &config, mode)?,
        Commands::Resolve { run_id, error_id } => {
            commands::resolve_error(&run_id, &error_id, db, &config)?
        }
    };

    if code != 0 {
        drop(guard);
        std::process::exit(code);
    }
    Ok(())
}
