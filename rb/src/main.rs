//! resbroker - exclusive-capability permission broker
//!
//! CLI entry point: acquire the configured resource permission, run the
//! subordinate command, release the permission, exit with the subordinate's
//! status.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::ExitStatus;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use resbroker::broker::{self, Broker, BrokerError, SessionOutcome};
use resbroker::cli::{Cli, Command};
use resbroker::config::Config;
use resbroker::manager::client::{ResourceClient, ResourceError};
use resbroker::subordinate;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resbroker")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level
        .or(config_log_level)
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    // The subordinate inherits stdout/stderr, so logs go to a file
    let log_file = fs::File::create(log_dir.join("rb.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The hidden wait mode is dispatched before logging or configuration are
    // touched: the subordinate must have no side effects before the go
    // signal.
    if let Some(Command::Wait { argv }) = &cli.command {
        std::process::exit(subordinate::wait_and_exec(argv));
    }

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref())
        .context("Failed to setup logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        None => cmd_run(config, Vec::new(), None, Vec::new()).await,
        Some(Command::Run { class, caps, argv }) => cmd_run(config, argv, class, caps).await,
        Some(Command::External(argv)) => cmd_run(config, argv, None, Vec::new()).await,
        Some(Command::Ping) => cmd_ping(config).await,
        Some(Command::Wait { .. }) => unreachable!("dispatched before logging setup"),
    }
}

/// Run one broker session and exit with the session's status
async fn cmd_run(
    mut config: Config,
    argv: Vec<OsString>,
    class: Option<String>,
    caps: Vec<String>,
) -> Result<()> {
    if let Some(class) = class {
        config.session.class = class;
    }
    if !caps.is_empty() {
        config.session.capabilities = caps;
    }
    info!(?argv, class = %config.session.class, "starting broker session");

    let broker = match Broker::new(config) {
        Ok(broker) => broker,
        Err(err) => {
            eprintln!("rb: {err}");
            std::process::exit(exit_code_for(&err));
        }
    };

    match broker.run(&argv).await {
        Ok(SessionOutcome::Completed(status)) => std::process::exit(exit_status_code(status)),
        Ok(SessionOutcome::Denied { status }) => {
            eprintln!("rb: resource manager denied the acquisition (status {status})");
            std::process::exit(broker::EXIT_DENIED);
        }
        Err(err) => {
            eprintln!("rb: {err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

/// Probe the manager endpoint
async fn cmd_ping(config: Config) -> Result<()> {
    let client = ResourceClient::new(&config.manager);
    match client.probe().await {
        Ok(()) => {
            println!(
                "resource manager reachable at {}",
                config.manager.socket.display()
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("rb: {err}");
            std::process::exit(broker::EXIT_UNAVAILABLE);
        }
    }
}

/// Mirror the subordinate's exit status (128+signal for signal deaths)
fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => 128 + signal,
        None => 1,
    }
}

/// Map broker failures onto their distinguishable exit codes
fn exit_code_for(err: &BrokerError) -> i32 {
    match err {
        BrokerError::Config(_) => broker::EXIT_USAGE,
        BrokerError::Spawn(_) => broker::EXIT_SPAWN,
        BrokerError::Resource(ResourceError::Connection(_)) => broker::EXIT_UNAVAILABLE,
        BrokerError::Resource(ResourceError::Denied { .. }) => broker::EXIT_DENIED,
        BrokerError::Resource(_) => broker::EXIT_PROTOCOL,
    }
}
