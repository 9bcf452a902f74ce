// src/engine/outcome.rs

//! Run outcomes and the process exit codes they map to.

use std::fmt;

use chrono::NaiveDate;

use crate::dag::instance::{TaskInstance, TaskState};
use crate::dag::task::TaskId;
use crate::errors::FailureKind;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_INTERNAL: i32 = 1;
pub const EXIT_STRUCTURAL: i32 = 2;
pub const EXIT_UPSTREAM_FAILURE: i32 = 3;
pub const EXIT_OPERATOR_FAILURE: i32 = 4;
pub const EXIT_QUALITY_FAILURE: i32 = 5;
pub const EXIT_CANCELLED: i32 = 130;

/// What made a Run fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    UpstreamFailure,
    OperatorFailure,
    QualityCheckFailure,
}

impl FailureClass {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureClass::UpstreamFailure => EXIT_UPSTREAM_FAILURE,
            FailureClass::OperatorFailure => EXIT_OPERATOR_FAILURE,
            FailureClass::QualityCheckFailure => EXIT_QUALITY_FAILURE,
        }
    }

    fn of(instance: &TaskInstance) -> Self {
        match (instance.state, instance.failure.as_ref().map(|f| f.kind)) {
            (TaskState::UpstreamFailed, _) | (_, Some(FailureKind::UpstreamFailed)) => {
                FailureClass::UpstreamFailure
            }
            (_, Some(FailureKind::QualityCheck)) => FailureClass::QualityCheckFailure,
            _ => FailureClass::OperatorFailure,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::UpstreamFailure => "upstream failure",
            FailureClass::OperatorFailure => "operator failure",
            FailureClass::QualityCheckFailure => "quality-check failure",
        })
    }
}

/// Terminal result of one Run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every instance ended SUCCESS or SKIPPED.
    Success,
    /// `task` is the first failing instance in topological order.
    Failed {
        task: TaskId,
        reason: String,
        class: FailureClass,
    },
    /// Cancelled before every instance became terminal.
    Cancelled,
}

impl RunOutcome {
    /// Derive the outcome from a Run's instances, given in topological order.
    pub fn from_instances(instances: &[TaskInstance], cancelled: bool) -> Self {
        if let Some(first) = instances.iter().find(|i| i.state.is_failure()) {
            return RunOutcome::Failed {
                task: first.key.task_id.clone(),
                reason: first
                    .failure
                    .as_ref()
                    .map(|f| f.reason.clone())
                    .unwrap_or_else(|| format!("task ended {}", first.state)),
                class: FailureClass::of(first),
            };
        }
        if cancelled && !instances.iter().all(|i| i.state.is_terminal()) {
            return RunOutcome::Cancelled;
        }
        RunOutcome::Success
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => EXIT_SUCCESS,
            RunOutcome::Failed { class, .. } => class.exit_code(),
            RunOutcome::Cancelled => EXIT_CANCELLED,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Success => f.write_str("SUCCESS"),
            RunOutcome::Failed { task, reason, class } => {
                write!(f, "FAILED ({class}) at task '{task}': {reason}")
            }
            RunOutcome::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// Final state of one Run, handed back to callers.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub dag_id: String,
    pub logical_date: NaiveDate,
    pub outcome: RunOutcome,
    /// Instances in topological order.
    pub instances: Vec<TaskInstance>,
}

impl RunReport {
    pub fn instance(&self, task_id: &str) -> Option<&TaskInstance> {
        self.instances.iter().find(|i| i.key.task_id == task_id)
    }

    pub fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.instance(task_id).map(|i| i.state)
    }
}
