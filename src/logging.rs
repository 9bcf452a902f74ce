// src/logging.rs

//! `tracing` subscriber setup.
//!
//! The filter comes from `--log-level` when given. Otherwise `BATCHDAG_LOG`
//! is read, either as a bare level (`debug`) or as full `EnvFilter`
//! directives (`info,batchdag::dag=debug`). With neither, only `info` and
//! above is shown.
//!
//! Output goes to stderr; stdout belongs to `validate`, `status` and the
//! `--events` JSON lines.

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "BATCHDAG_LOG";

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV_VAR).ok();
    let filter = log_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Resolve the filter from the CLI flag and the raw `BATCHDAG_LOG` value.
pub fn log_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(only(level.into()));
    }

    let Some(raw) = env.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(only(LevelFilter::INFO));
    };
    match parse_level_str(raw) {
        Some(level) => Ok(only(level.into())),
        None => EnvFilter::try_new(raw).with_context(|| format!("invalid {LOG_ENV_VAR} value '{raw}'")),
    }
}

fn only(level: LevelFilter) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Bare level names, case-insensitive; `warning` is accepted for `warn`.
pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_ascii_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
