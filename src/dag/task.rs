// src/dag/task.rs

//! Task Definitions and retry policy.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::operators::OperatorSpec;

/// Canonical task identifier type used throughout the crate.
pub type TaskId = String;

/// Fixed-delay retry policy (no exponential backoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Whether an instance that has already been retried `retry_count` times
    /// may be retried again.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Earliest time a retry scheduled at `now` may be queued.
    pub fn next_eligible(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.retry_delay).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// One node of the DAG. Immutable once the DAG is built.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub operator: OperatorSpec,
    /// Direct upstream task ids (`after = [...]`).
    pub upstream: Vec<TaskId>,
    pub retry: RetryPolicy,
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>, operator: OperatorSpec) -> Self {
        Self {
            id: id.into(),
            operator,
            upstream: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn after(mut self, upstream: impl Into<TaskId>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
