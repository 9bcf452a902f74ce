use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::dag::graph::DagGraph;
use crate::dag::instance::{FailureRecord, InstanceKey, ScheduledInstance, TaskInstance, TaskState};
use crate::dag::scheduler_step::{SchedulerStep, TerminalChange};
use crate::dag::store::{InstanceStore, TransitionChange};
use crate::dag::task::TaskId;
use crate::errors::{BatchdagError, FailureKind, Result};
use crate::operators::{Completion, OperatorResult};

/// Scheduler holds the immutable DAG plus a handle to the instance store.
///
/// It is responsible for:
/// - creating the Task Instances of a Run on demand
/// - queueing instances whose upstream instances all succeeded
/// - propagating UPSTREAM_FAILED to everything below a failed instance
/// - moving queued instances to RUNNING, bounded by `max_active`
/// - applying the retry policy when an operator fails
///
/// It keeps no per-run state of its own; every decision is re-derived from
/// the store, so several Runs (dates) can share one scheduler.
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<DagGraph>,
    store: Arc<InstanceStore>,
    max_active: usize,
}

impl Scheduler {
    pub fn new(graph: Arc<DagGraph>, store: Arc<InstanceStore>, max_active: usize) -> Self {
        Self {
            graph,
            store,
            max_active: max_active.max(1),
        }
    }

    pub fn graph(&self) -> &Arc<DagGraph> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    fn key(&self, task_id: &str, date: NaiveDate) -> InstanceKey {
        InstanceKey::new(self.graph.dag_id(), task_id, date)
    }

    /// Create (or reset) one instance per task for `date`.
    ///
    /// Instances left over from an earlier Run of the same date are cleared
    /// back to NONE so the date runs from scratch.
    pub fn prepare_run(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<()> {
        let mut cleared = 0usize;
        for task in self.graph.topological_order() {
            let key = self.key(&task.id, date);
            let inst = self.store.ensure(&key)?;
            if inst.state != TaskState::None || inst.retry_count != 0 {
                self.store.clear(&key, now)?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(
                dag = self.graph.dag_id(),
                logical_date = %date,
                cleared,
                "scheduler: re-running date; cleared previous task instances"
            );
        } else {
            debug!(dag = self.graph.dag_id(), logical_date = %date, "scheduler: run prepared");
        }
        Ok(())
    }

    /// All instances of the Run for `date`, in topological order.
    pub fn instances(&self, date: NaiveDate) -> Result<Vec<TaskInstance>> {
        let mut by_task = self.load(date)?;
        Ok(self
            .graph
            .topological_order()
            .filter_map(|t| by_task.remove(&t.id))
            .collect())
    }

    pub fn running_count(&self, date: NaiveDate) -> Result<usize> {
        Ok(self
            .load(date)?
            .values()
            .filter(|i| i.state == TaskState::Running)
            .count())
    }

    /// Every task has a terminal instance for `date`.
    pub fn is_finished(&self, date: NaiveDate) -> Result<bool> {
        let by_task = self.load(date)?;
        Ok(all_terminal(&self.graph, &by_task))
    }

    /// Earliest `next_eligible_at` among instances waiting to be retried.
    pub fn next_wakeup(&self, date: NaiveDate) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .load(date)?
            .values()
            .filter(|i| i.state == TaskState::UpForRetry)
            .filter_map(|i| i.next_eligible_at)
            .min())
    }

    /// Advance the Run for `date` as far as it can go at `now`.
    ///
    /// Walks the DAG in topological order so a failure propagates to all
    /// transitive downstream instances within a single step. When
    /// `dispatch_allowed` is false (the Run was cancelled) queued instances
    /// stay queued.
    pub fn step(&self, date: NaiveDate, now: DateTime<Utc>, dispatch_allowed: bool) -> Result<SchedulerStep> {
        let mut by_task = self.load(date)?;
        let mut step = SchedulerStep::default();

        for task in self.graph.topological_order() {
            let Some(state) = by_task.get(&task.id).map(|i| i.state) else {
                return Err(BatchdagError::TaskNotFound(self.key(&task.id, date).to_string()));
            };
            let key = self.key(&task.id, date);

            match state {
                TaskState::None => {
                    let upstream = self.graph.upstream_of(&task.id);
                    let failed_upstream = upstream.iter().find(|up| {
                        by_task
                            .get(**up)
                            .is_some_and(|i| i.state.is_failure())
                    });

                    if let Some(up) = failed_upstream {
                        let up_state = by_task.get(*up).map(|i| i.state).unwrap_or(TaskState::Failed);
                        let reason = format!("upstream task '{up}' ended {up_state}");
                        let change = TransitionChange::at(now).with_failure(FailureRecord {
                            kind: FailureKind::UpstreamFailed,
                            reason: reason.clone(),
                        });
                        if self.store.transition(&key, state, TaskState::UpstreamFailed, change)? {
                            debug!(task = %task.id, logical_date = %date, upstream = %up, "marking upstream_failed");
                            set_state(&mut by_task, &task.id, TaskState::UpstreamFailed);
                            step.newly_terminal.push(TerminalChange {
                                task_id: task.id.clone(),
                                state: TaskState::UpstreamFailed,
                                reason: Some(reason),
                            });
                        }
                    } else if upstream.iter().all(|up| {
                        by_task.get(*up).is_some_and(|i| i.state.is_success_like())
                    }) && self
                        .store
                        .transition(&key, state, TaskState::Queued, TransitionChange::at(now))?
                    {
                        debug!(task = %task.id, logical_date = %date, "dependencies satisfied; queued");
                        set_state(&mut by_task, &task.id, TaskState::Queued);
                    }
                }
                TaskState::UpForRetry => {
                    let eligible = by_task
                        .get(&task.id)
                        .and_then(|i| i.next_eligible_at)
                        .is_none_or(|at| at <= now);
                    if eligible
                        && self.store.transition(
                            &key,
                            state,
                            TaskState::Queued,
                            TransitionChange::at(now).with_reason("retry delay elapsed"),
                        )?
                    {
                        debug!(task = %task.id, logical_date = %date, "retry delay elapsed; queued");
                        set_state(&mut by_task, &task.id, TaskState::Queued);
                    }
                }
                _ => {}
            }
        }

        if dispatch_allowed {
            let mut running = by_task
                .values()
                .filter(|i| i.state == TaskState::Running)
                .count();

            for task in self.graph.topological_order() {
                if running >= self.max_active {
                    break;
                }
                let Some(inst) = by_task.get(&task.id) else {
                    continue;
                };
                if inst.state != TaskState::Queued {
                    continue;
                }
                let attempt = inst.attempt();
                let key = self.key(&task.id, date);
                if self
                    .store
                    .transition(&key, TaskState::Queued, TaskState::Running, TransitionChange::at(now))?
                {
                    set_state(&mut by_task, &task.id, TaskState::Running);
                    running += 1;
                    step.newly_scheduled.push(ScheduledInstance {
                        key,
                        task: Arc::clone(task),
                        attempt,
                    });
                }
            }
        }

        step.run_finished = all_terminal(&self.graph, &by_task);
        Ok(step)
    }

    /// Record the result of one operator attempt.
    ///
    /// Completions for an instance that is no longer RUNNING, or for an
    /// older attempt, are ignored. The returned step never dispatches; call
    /// [`Self::step`] afterwards to release downstream work.
    pub fn complete(
        &self,
        date: NaiveDate,
        task_id: &str,
        attempt: u32,
        result: &OperatorResult,
        now: DateTime<Utc>,
    ) -> Result<SchedulerStep> {
        let key = self.key(task_id, date);
        let task = self
            .graph
            .task(task_id)
            .ok_or_else(|| BatchdagError::TaskNotFound(key.to_string()))?;
        let inst = self
            .store
            .get(&key)?
            .ok_or_else(|| BatchdagError::TaskNotFound(key.to_string()))?;

        let mut step = SchedulerStep::default();

        if inst.state != TaskState::Running || inst.attempt() != attempt {
            warn!(
                task = %task_id,
                logical_date = %date,
                attempt,
                state = %inst.state,
                "stale completion; ignoring"
            );
            return Ok(step);
        }

        match result {
            Ok(Completion::Done) => {
                if self
                    .store
                    .transition(&key, TaskState::Running, TaskState::Success, TransitionChange::at(now))?
                {
                    info!(task = %task_id, logical_date = %date, attempt, "task instance succeeded");
                    step.newly_terminal.push(TerminalChange {
                        task_id: task_id.to_string(),
                        state: TaskState::Success,
                        reason: None,
                    });
                }
            }
            Ok(Completion::Skipped(reason)) => {
                let change = TransitionChange::at(now).with_reason(reason.clone());
                if self
                    .store
                    .transition(&key, TaskState::Running, TaskState::Skipped, change)?
                {
                    info!(task = %task_id, logical_date = %date, %reason, "task instance skipped");
                    step.newly_terminal.push(TerminalChange {
                        task_id: task_id.to_string(),
                        state: TaskState::Skipped,
                        reason: Some(reason.clone()),
                    });
                }
            }
            Err(err) => {
                let failure = FailureRecord {
                    kind: err.kind(),
                    reason: err.to_string(),
                };
                let failed = TransitionChange::at(now).with_failure(failure.clone());

                if task.retry.allows_retry(inst.retry_count) {
                    let next_eligible = task.retry.next_eligible(now);
                    let retry = TransitionChange::at(now)
                        .with_reason(failure.reason.clone())
                        .eligible_at(next_eligible);
                    // RUNNING -> FAILED -> UP_FOR_RETRY commits as one unit.
                    if !self.store.transition_chain(
                        &key,
                        TaskState::Running,
                        &[(TaskState::Failed, failed), (TaskState::UpForRetry, retry)],
                    )? {
                        return Ok(step);
                    }
                    warn!(
                        task = %task_id,
                        logical_date = %date,
                        attempt,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        next_eligible = %next_eligible,
                        "task instance failed; will retry"
                    );
                    step.retrying.push(task_id.to_string());
                } else {
                    if !self
                        .store
                        .transition(&key, TaskState::Running, TaskState::Failed, failed)?
                    {
                        return Ok(step);
                    }
                    warn!(
                        task = %task_id,
                        logical_date = %date,
                        attempt,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "task instance failed; retries exhausted"
                    );
                    step.newly_terminal.push(TerminalChange {
                        task_id: task_id.to_string(),
                        state: TaskState::Failed,
                        reason: Some(failure.reason),
                    });
                }
            }
        }

        Ok(step)
    }

    fn load(&self, date: NaiveDate) -> Result<HashMap<TaskId, TaskInstance>> {
        Ok(self
            .store
            .instances_for_date(self.graph.dag_id(), date)?
            .into_iter()
            .map(|i| (i.key.task_id.clone(), i))
            .collect())
    }
}

fn set_state(by_task: &mut HashMap<TaskId, TaskInstance>, task_id: &str, state: TaskState) {
    if let Some(inst) = by_task.get_mut(task_id) {
        inst.state = state;
    }
}

fn all_terminal(graph: &DagGraph, by_task: &HashMap<TaskId, TaskInstance>) -> bool {
    graph
        .tasks()
        .all(|t| by_task.get(&t.id).is_some_and(|i| i.state.is_terminal()))
}
