use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging based on output mode and debug flag
///
/// `RUST_LOG` overrides the level chosen from the flags. When a log file is
/// given, the returned guard must be held until exit so buffered lines are
/// flushed.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    log_file: Option<PathBuf>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if debug {
        "agent_flow=debug"
    } else if quiet {
        "agent_flow=error"
    } else {
        "agent_flow=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    if let Some(log_path) = log_file {
        let dir = match log_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let filename = log_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", log_path.display()))?;

        let appender = tracing_appender::rolling::never(&dir, filename);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        // One JSON object per line so run logs can be grepped by run_id
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        Ok(None)
    }
}

/// Get default log file path for a command
pub fn default_log_path(name: &str) -> anyhow::Result<PathBuf> {
    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("agent-flow")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let filename = format!("{}-{}.log", name, timestamp);

    Ok(log_dir.join(filename))
}
