use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use kiln_agent::{Agent, AgentConfig};

fn main() -> Result<()> {
    // Parse and validate before anything else; there is no connection yet to report through
    let config = AgentConfig::parse();
    config.validate().context("invalid agent configuration")?;

    if !config.foreground {
        return detach(&config);
    }

    // Initialize logging
    let _guard = setup_logging(&config)?;
    info!(
        job = %config.job,
        remote_ref = %config.remote_ref,
        commit = %config.commit,
        "Starting kiln-agent {}",
        env!("CARGO_PKG_VERSION")
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let summary = runtime.block_on(async { Agent::new(config)?.run().await });

    match summary {
        Ok(summary) => {
            info!(
                succeeded = summary.succeeded,
                sent = summary.transport.sent,
                dropped = summary.transport.dropped,
                "Exiting"
            );
            Ok(())
        }
        Err(e) => {
            error!("Agent failed: {}", e);
            Err(e).context("agent run failed")
        }
    }
}

/// Re-run this binary in its own process group with output going to the log file
fn detach(config: &AgentConfig) -> Result<()> {
    let log_file = config.log_file();
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    let exe = std::env::current_exe().context("failed to locate the agent executable")?;
    let child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .arg("--foreground")
        .env("KILN_LOG_FILE", &log_file)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .process_group(0)
        .spawn()
        .context("failed to start the detached agent")?;

    println!(
        "kiln-agent running in the background (pid {}), logging to {}",
        child.id(),
        log_file.display()
    );
    Ok(())
}

fn setup_logging(config: &AgentConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let name = path
                .file_name()
                .with_context(|| format!("log file {} has no file name", path.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(config.log_file.is_none())
        .with_writer(writer)
        .init();

    Ok(guard)
}
