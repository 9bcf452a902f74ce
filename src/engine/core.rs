// src/engine/core.rs

//! Pure core runtime state machine for one Run.
//!
//! This module contains a synchronous "core runtime" that consumes
//! [`RunEvent`]s and produces:
//! - state changes in the instance store (through the scheduler)
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - handing `ScheduledInstance`s to the executor
//! - waking up when a retry becomes eligible
//! - handling Ctrl+C / cancellation
//!
//! The core takes the current time as an argument, so it can be tested
//! without any Tokio, channels or real clocks.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::alerts::AlertEvent;
use crate::dag::{ScheduledInstance, Scheduler, SchedulerStep};
use crate::engine::outcome::RunOutcome;
use crate::engine::RunEvent;
use crate::errors::Result;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand these instances to the executor.
    Dispatch(Vec<ScheduledInstance>),
    /// Publish an alert event.
    Notify(AlertEvent),
    /// The Run is over.
    Finish(RunOutcome),
}

/// Decision returned by the core after handling a single [`RunEvent`].
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
    /// When the shell should send a [`RunEvent::Tick`] if nothing else
    /// happens first (earliest pending retry).
    pub wake_at: Option<DateTime<Utc>>,
}

impl CoreStep {
    pub fn dispatched(&self) -> Vec<&ScheduledInstance> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(v) => Some(v.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.commands.iter().find_map(|c| match c {
            CoreCommand::Finish(o) => Some(o),
            _ => None,
        })
    }
}

/// Pure core runtime state for one logical date.
#[derive(Debug)]
pub struct CoreRuntime {
    scheduler: Arc<Scheduler>,
    date: NaiveDate,
    cancelled: bool,
    finished: bool,
}

impl CoreRuntime {
    pub fn new(scheduler: Arc<Scheduler>, date: NaiveDate) -> Self {
        Self {
            scheduler,
            date,
            cancelled: false,
            finished: false,
        }
    }

    pub fn logical_date(&self) -> NaiveDate {
        self.date
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle a single event, updating the store and returning the resulting
    /// commands for the IO shell.
    pub fn step(&mut self, event: RunEvent, now: DateTime<Utc>) -> Result<CoreStep> {
        if self.finished {
            debug!(logical_date = %self.date, ?event, "run already finished; ignoring event");
            return Ok(CoreStep {
                commands: Vec::new(),
                keep_running: false,
                wake_at: None,
            });
        }

        let dispatch = !self.cancelled;
        let step = match event {
            RunEvent::Start => {
                self.scheduler.prepare_run(self.date, now)?;
                self.scheduler.step(self.date, now, dispatch)?
            }
            RunEvent::InstanceFinished {
                task_id,
                attempt,
                result,
            } => {
                let mut step = self
                    .scheduler
                    .complete(self.date, &task_id, attempt, &result, now)?;
                step.absorb(self.scheduler.step(self.date, now, dispatch)?);
                step
            }
            RunEvent::Tick => self.scheduler.step(self.date, now, dispatch)?,
            RunEvent::CancelRequested => {
                if !self.cancelled {
                    info!(logical_date = %self.date, "run cancelled; in-flight instances will finish");
                }
                self.cancelled = true;
                self.scheduler.step(self.date, now, false)?
            }
        };

        self.commands_for(step, now)
    }

    fn commands_for(&mut self, step: SchedulerStep, now: DateTime<Utc>) -> Result<CoreStep> {
        let dag_id = self.scheduler.graph().dag_id().to_string();
        let mut commands = Vec::new();

        for change in &step.newly_terminal {
            commands.push(CoreCommand::Notify(AlertEvent::InstanceFinished {
                dag_id: dag_id.clone(),
                task_id: change.task_id.clone(),
                logical_date: self.date,
                state: change.state,
                reason: change.reason.clone(),
                at: now,
            }));
        }

        if !step.newly_scheduled.is_empty() {
            commands.push(CoreCommand::Dispatch(step.newly_scheduled));
        }

        let quiescent =
            self.cancelled && self.scheduler.running_count(self.date)? == 0;

        if step.run_finished || quiescent {
            let instances = self.scheduler.instances(self.date)?;
            let outcome = RunOutcome::from_instances(&instances, self.cancelled);
            let (failed_task, reason) = match &outcome {
                RunOutcome::Failed { task, reason, .. } => (Some(task.clone()), Some(reason.clone())),
                _ => (None, None),
            };
            commands.push(CoreCommand::Notify(AlertEvent::RunFinished {
                dag_id,
                logical_date: self.date,
                outcome: outcome.label().to_string(),
                failed_task,
                reason,
                at: now,
            }));
            info!(logical_date = %self.date, %outcome, "run finished");
            commands.push(CoreCommand::Finish(outcome));
            self.finished = true;

            return Ok(CoreStep {
                commands,
                keep_running: false,
                wake_at: None,
            });
        }

        let wake_at = if self.cancelled {
            None
        } else {
            self.scheduler.next_wakeup(self.date)?
        };

        Ok(CoreStep {
            commands,
            keep_running: true,
            wake_at,
        })
    }
}
