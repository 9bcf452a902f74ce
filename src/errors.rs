// src/errors.rs

//! Crate-wide error types.
//!
//! - [`BatchdagError`] is what library entry points return.
//! - [`StructuralError`] describes a malformed DAG; it is fatal at
//!   construction and never retried.
//! - [`OperatorError`] is what an operator signals when `execute` fails. The
//!   scheduler turns it into a Task Instance transition; it never escapes the
//!   dispatch loop.

use thiserror::Error;

use crate::dag::instance::TaskState;
use crate::operators::quality::Comparison;
use crate::warehouse::SqlValue;

#[derive(Error, Debug)]
pub enum BatchdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Structural DAG error: {0}")]
    Structural(#[from] StructuralError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for {instance}: {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("State store error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A DAG definition that can never be scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("DAG must contain at least one task")]
    Empty,

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' has unknown upstream '{upstream}'")]
    UnknownUpstream { task: String, upstream: String },

    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("cycle detected in task DAG involving task '{0}'")]
    Cycle(String),
}

/// Failure signalled by an operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    /// Network/timeout class failure; expected to go away on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed SQL, schema mismatch, bad input data.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("quality check '{check}' failed: observed {observed}, expected {comparison} {expected}")]
    QualityCheckFailed {
        check: String,
        observed: SqlValue,
        expected: SqlValue,
        comparison: Comparison,
    },
}

impl OperatorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OperatorError::Transient(_) => FailureKind::Transient,
            OperatorError::Permanent(_) => FailureKind::Permanent,
            OperatorError::QualityCheckFailed { .. } => FailureKind::QualityCheck,
        }
    }
}

/// Classification stored alongside a failed Task Instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
    QualityCheck,
    UpstreamFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::QualityCheck => "quality_check",
            FailureKind::UpstreamFailed => "upstream_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            "quality_check" => Some(FailureKind::QualityCheck),
            "upstream_failed" => Some(FailureKind::UpstreamFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BatchdagError>;
