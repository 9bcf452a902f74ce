// src/dag/instance.rs

//! Task Instance model and its state machine.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::task::{TaskDefinition, TaskId};
use crate::errors::FailureKind;

/// State of one (task, logical run date) pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    None,
    Queued,
    Running,
    Success,
    Failed,
    UpForRetry,
    UpstreamFailed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::None => "none",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::UpForRetry => "up_for_retry",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
        }
    }

    /// `FAILED` is only terminal once retries are exhausted; the scheduler
    /// moves it straight on to `UP_FOR_RETRY` otherwise, so an instance seen
    /// resting in `FAILED` is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    /// Satisfies downstream dependencies.
    pub fn is_success_like(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Skipped)
    }

    /// Terminal and not a success: blocks downstream forever.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }

    /// Allowed edges of the state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (None, Queued)
                | (None, UpstreamFailed)
                | (Queued, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Skipped)
                | (Failed, UpForRetry)
                | (UpForRetry, Queued)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(TaskState::None),
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "success" => Ok(TaskState::Success),
            "failed" => Ok(TaskState::Failed),
            "up_for_retry" => Ok(TaskState::UpForRetry),
            "upstream_failed" => Ok(TaskState::UpstreamFailed),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

/// Primary key of a Task Instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub dag_id: String,
    pub task_id: TaskId,
    pub logical_date: NaiveDate,
}

impl InstanceKey {
    pub fn new(dag_id: impl Into<String>, task_id: impl Into<TaskId>, logical_date: NaiveDate) -> Self {
        Self {
            dag_id: dag_id.into(),
            task_id: task_id.into(),
            logical_date,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.dag_id, self.task_id, self.logical_date)
    }
}

/// Why an instance did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInstance {
    pub key: InstanceKey,
    pub state: TaskState,
    pub retry_count: u32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// When an `UP_FOR_RETRY` instance may be queued again.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Most recent failure (kept across retries, cleared on success).
    pub failure: Option<FailureRecord>,
}

impl TaskInstance {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            state: TaskState::None,
            retry_count: 0,
            queued_at: None,
            started_at: None,
            ended_at: None,
            next_eligible_at: None,
            failure: None,
        }
    }

    /// 1-based number of the attempt currently (or last) running.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// One row of the append-only transition history.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub retry_count: u32,
    pub reason: Option<String>,
}

/// Description of a task instance the scheduler wants executed now.
#[derive(Debug, Clone)]
pub struct ScheduledInstance {
    pub key: InstanceKey,
    pub task: Arc<TaskDefinition>,
    pub attempt: u32,
}
