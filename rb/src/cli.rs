//! CLI command definitions and subcommands

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// resbroker - run a command while holding an exclusive resource permission
#[derive(Parser)]
#[command(
    name = "rb",
    about = "Acquire an exclusive resource permission, run a command, release it",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Acquire the configured resource, then run COMMAND until it exits
    ///
    /// With no COMMAND the full acquire/release bracket still runs, with
    /// nothing executed in between.
    Run {
        /// Override the registered application class
        #[arg(long)]
        class: Option<String>,

        /// Capability to request (repeatable; default video-playback)
        #[arg(long = "cap", value_name = "NAME")]
        caps: Vec<String>,

        /// Command and arguments, forwarded verbatim
        #[arg(
            value_name = "COMMAND",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        argv: Vec<OsString>,
    },

    /// Check that the resource-manager endpoint is reachable
    Ping,

    /// Internal: block on the go pipe, then exec the command (used by the spawner)
    #[command(hide = true)]
    Wait {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<OsString>,
    },

    /// Any other command line is the command to run with default settings
    #[command(external_subcommand)]
    External(Vec<OsString>),
}
