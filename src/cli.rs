// src/cli.rs

//! CLI argument parsing using `clap`.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0    success
  1    internal error
  2    invalid config or DAG
  3    upstream failure (reserved: a Run reports its root-cause task, so this
       only appears when no instance of the Run itself failed)
  4    operator failure
  5    quality-check failure
  130  cancelled";

/// Command-line arguments for `batchdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "batchdag",
    version,
    about = "Run a date-partitioned batch pipeline DAG: stage, load, quality-check, backfill.",
    long_about = None,
    after_help = EXIT_CODES_HELP
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Batchdag.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "Batchdag.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BATCHDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Print alert events as JSON lines on stdout.
    #[arg(long, global = true)]
    pub events: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Parse and validate the DAG, print its topological order, run nothing.
    Validate,

    /// Trigger one Run (today by default).
    Run(RunArgs),

    /// Run every date in an inclusive range.
    Backfill(BackfillArgs),

    /// Show a Task Instance's state, optionally with its transition history.
    Status(StatusArgs),

    /// Apply a DDL script to a warehouse connection.
    Setup(SetupArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Logical date (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(long, value_name = "DATE", conflicts_with = "catchup")]
    pub date: Option<NaiveDate>,

    /// Run every date from `[dag].start_date` to today that has no
    /// successful Run yet.
    #[arg(long)]
    pub catchup: bool,
}

#[derive(Debug, Clone, Args)]
pub struct BackfillArgs {
    /// First logical date (inclusive).
    #[arg(long, value_name = "DATE")]
    pub start: NaiveDate,

    /// Last logical date (inclusive).
    #[arg(long, value_name = "DATE")]
    pub end: NaiveDate,

    /// Run up to N dates concurrently instead of strictly in order.
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Do not start further dates after the first failed one.
    #[arg(long)]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[arg(long, value_name = "TASK")]
    pub task: String,

    #[arg(long, value_name = "DATE")]
    pub date: NaiveDate,

    /// Also print every recorded state transition.
    #[arg(long)]
    pub history: bool,
}

#[derive(Debug, Clone, Args)]
pub struct SetupArgs {
    /// SQL file with the warehouse schema.
    #[arg(long, value_name = "FILE")]
    pub ddl: String,

    /// Warehouse connection to apply it to.
    #[arg(long, value_name = "NAME", default_value = "warehouse")]
    pub connection: String,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
