// tests/scheduler_retry.rs
//
// Drives the scheduler by hand with explicit clocks, no runtime involved.

mod common;
use crate::common::builders::noop_task;
use crate::common::date;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use batchdag::dag::{DagGraph, InstanceKey, InstanceStore, RetryPolicy, Scheduler, TaskState};
use batchdag::errors::{FailureKind, OperatorError};
use batchdag::operators::{Completion, OperatorResult};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 11, 6, 1, 0, 0).unwrap()
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + TimeDelta::minutes(m)
}

fn transient() -> OperatorResult {
    Err(OperatorError::Transient("read timed out".to_string()))
}

fn chain_scheduler(max_active: usize) -> Scheduler {
    let graph = DagGraph::new(
        "sparkify",
        vec![
            noop_task("StageEvents"),
            noop_task("LoadSongplaysFact").after("StageEvents"),
        ],
    )
    .unwrap();
    let store = Arc::new(InstanceStore::open_in_memory().unwrap());
    Scheduler::new(Arc::new(graph), store, max_active)
}

fn state(s: &Scheduler, task: &str) -> TaskState {
    let key = InstanceKey::new("sparkify", task, date("2018-11-05"));
    s.store().get(&key).unwrap().unwrap().state
}

#[test]
fn start_queues_and_dispatches_only_ready_tasks() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();

    let step = s.step(day, t0(), true).unwrap();
    assert_eq!(step.scheduled_ids(), ["StageEvents"]);
    assert_eq!(step.newly_scheduled[0].attempt, 1);
    assert!(!step.run_finished);

    assert_eq!(state(&s, "StageEvents"), TaskState::Running);
    assert_eq!(state(&s, "LoadSongplaysFact"), TaskState::None);
}

#[test]
fn transient_failure_waits_for_the_fixed_delay() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();

    let step = s.complete(day, "StageEvents", 1, &transient(), minutes(1)).unwrap();
    assert_eq!(step.retrying, ["StageEvents"]);
    assert!(step.newly_terminal.is_empty());
    assert_eq!(state(&s, "StageEvents"), TaskState::UpForRetry);
    assert_eq!(s.next_wakeup(day).unwrap(), Some(minutes(6)));

    // Default policy: fixed 5 minute delay.
    let early = s.step(day, minutes(5), true).unwrap();
    assert!(early.newly_scheduled.is_empty());
    assert_eq!(state(&s, "StageEvents"), TaskState::UpForRetry);

    let due = s.step(day, minutes(6), true).unwrap();
    assert_eq!(due.scheduled_ids(), ["StageEvents"]);
    assert_eq!(due.newly_scheduled[0].attempt, 2);
    assert_eq!(state(&s, "LoadSongplaysFact"), TaskState::None);
}

#[test]
fn retries_exhaust_after_max_retries() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();

    let mut now = t0();
    for attempt in 1..=3 {
        now += TimeDelta::minutes(1);
        let step = s.complete(day, "StageEvents", attempt, &transient(), now).unwrap();
        assert_eq!(step.retrying, ["StageEvents"], "attempt {attempt} should be retried");
        now += TimeDelta::minutes(5);
        let step = s.step(day, now, true).unwrap();
        assert_eq!(step.newly_scheduled[0].attempt, attempt + 1);
    }

    now += TimeDelta::minutes(1);
    let mut step = s.complete(day, "StageEvents", 4, &transient(), now).unwrap();
    step.absorb(s.step(day, now, true).unwrap());

    let terminal: Vec<_> = step
        .newly_terminal
        .iter()
        .map(|c| (c.task_id.as_str(), c.state))
        .collect();
    assert_eq!(
        terminal,
        [
            ("StageEvents", TaskState::Failed),
            ("LoadSongplaysFact", TaskState::UpstreamFailed),
        ]
    );
    assert!(step.run_finished);

    let key = InstanceKey::new("sparkify", "StageEvents", day);
    let inst = s.store().get(&key).unwrap().unwrap();
    assert_eq!(inst.retry_count, 3);
    assert_eq!(inst.failure.unwrap().kind, FailureKind::Transient);
}

#[test]
fn zero_retries_fail_immediately() {
    let graph = DagGraph::new(
        "sparkify",
        vec![noop_task("LoadUsers").with_retry(RetryPolicy::new(0, Duration::from_secs(300)))],
    )
    .unwrap();
    let s = Scheduler::new(Arc::new(graph), Arc::new(InstanceStore::open_in_memory().unwrap()), 1);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();

    let step = s
        .complete(day, "LoadUsers", 1, &Err(OperatorError::Permanent("no such table: users".into())), minutes(1))
        .unwrap();
    assert!(step.retrying.is_empty());
    assert_eq!(step.newly_terminal[0].state, TaskState::Failed);
    assert!(s.is_finished(day).unwrap());
}

#[test]
fn stale_completion_is_ignored() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();
    s.complete(day, "StageEvents", 1, &transient(), minutes(1)).unwrap();
    s.step(day, minutes(6), true).unwrap();

    // A late duplicate for attempt 1 must not touch attempt 2.
    let step = s.complete(day, "StageEvents", 1, &Ok(Completion::Done), minutes(7)).unwrap();
    assert!(step.newly_terminal.is_empty());
    assert_eq!(state(&s, "StageEvents"), TaskState::Running);
}

#[test]
fn skipped_upstream_releases_downstream() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();

    let mut step = s
        .complete(day, "StageEvents", 1, &Ok(Completion::Skipped("empty partition".into())), minutes(1))
        .unwrap();
    step.absorb(s.step(day, minutes(1), true).unwrap());

    assert_eq!(step.newly_terminal[0].state, TaskState::Skipped);
    assert_eq!(step.scheduled_ids(), ["LoadSongplaysFact"]);
}

#[test]
fn dispatch_is_capped_by_max_active() {
    let graph = DagGraph::new(
        "fanout",
        vec![
            noop_task("Start"),
            noop_task("LoadUsers").after("Start"),
            noop_task("LoadSongs").after("Start"),
            noop_task("LoadArtists").after("Start"),
            noop_task("LoadTime").after("Start"),
        ],
    )
    .unwrap();
    let s = Scheduler::new(Arc::new(graph), Arc::new(InstanceStore::open_in_memory().unwrap()), 2);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();

    let mut step = s.complete(day, "Start", 1, &Ok(Completion::Done), minutes(1)).unwrap();
    step.absorb(s.step(day, minutes(1), true).unwrap());
    assert_eq!(step.scheduled_ids(), ["LoadUsers", "LoadSongs"]);
    assert_eq!(s.running_count(day).unwrap(), 2);

    let mut step = s.complete(day, "LoadUsers", 1, &Ok(Completion::Done), minutes(2)).unwrap();
    step.absorb(s.step(day, minutes(2), true).unwrap());
    assert_eq!(step.scheduled_ids(), ["LoadArtists"]);
}

#[test]
fn cancelled_step_queues_but_never_dispatches() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();

    let step = s.step(day, t0(), false).unwrap();
    assert!(step.newly_scheduled.is_empty());
    assert_eq!(state(&s, "StageEvents"), TaskState::Queued);
}

#[test]
fn prepare_run_clears_a_previous_attempt_of_the_date() {
    let s = chain_scheduler(4);
    let day = date("2018-11-05");
    s.prepare_run(day, t0()).unwrap();
    s.step(day, t0(), true).unwrap();
    s.complete(day, "StageEvents", 1, &Ok(Completion::Done), minutes(1)).unwrap();
    s.step(day, minutes(1), true).unwrap();
    s.complete(day, "LoadSongplaysFact", 1, &Ok(Completion::Done), minutes(2)).unwrap();
    assert!(s.is_finished(day).unwrap());

    s.prepare_run(day, minutes(60)).unwrap();
    assert_eq!(state(&s, "StageEvents"), TaskState::None);
    assert_eq!(state(&s, "LoadSongplaysFact"), TaskState::None);
    assert!(!s.is_finished(day).unwrap());
}
