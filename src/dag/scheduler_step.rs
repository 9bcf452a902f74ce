// src/dag/scheduler_step.rs

//! Step-by-step execution result types for the scheduler.

use crate::dag::instance::{ScheduledInstance, TaskState};
use crate::dag::task::TaskId;

/// An instance that reached a terminal state during a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalChange {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
}

/// Structured result of a single scheduler "step".
///
/// Tests use it to manually step a Run and assert on what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Instances moved QUEUED -> RUNNING in this step; they must be executed.
    pub newly_scheduled: Vec<ScheduledInstance>,
    /// Instances that reached a terminal state in this step, in the order the
    /// transitions happened.
    pub newly_terminal: Vec<TerminalChange>,
    /// Instances that failed and were put UP_FOR_RETRY in this step.
    pub retrying: Vec<TaskId>,
    /// Every instance of the Run is terminal.
    pub run_finished: bool,
}

impl SchedulerStep {
    /// Fold `later` into `self`; `run_finished` reflects the later step.
    pub fn absorb(&mut self, later: SchedulerStep) {
        self.newly_scheduled.extend(later.newly_scheduled);
        self.newly_terminal.extend(later.newly_terminal);
        self.retrying.extend(later.retrying);
        self.run_finished = later.run_finished;
    }

    pub fn scheduled_ids(&self) -> Vec<&str> {
        self.newly_scheduled
            .iter()
            .map(|s| s.key.task_id.as_str())
            .collect()
    }
}
