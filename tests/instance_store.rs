// tests/instance_store.rs

mod common;
use crate::common::date;

use std::sync::Arc;
use std::thread;

use chrono::{TimeZone, Utc};

use batchdag::dag::store::TransitionChange;
use batchdag::dag::{InstanceKey, InstanceStore, TaskState};
use batchdag::dag::instance::FailureRecord;
use batchdag::errors::{BatchdagError, FailureKind};

fn key(task: &str) -> InstanceKey {
    InstanceKey::new("sparkify", task, date("2018-11-05"))
}

fn at(minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 11, 6, 0, minute, 0).unwrap()
}

#[test]
fn ensure_creates_instance_in_none_once() {
    let store = InstanceStore::open_in_memory().unwrap();

    let first = store.ensure(&key("StageEvents")).unwrap();
    assert_eq!(first.state, TaskState::None);
    assert_eq!(first.retry_count, 0);

    assert!(store
        .transition(&key("StageEvents"), TaskState::None, TaskState::Queued, TransitionChange::at(at(0)))
        .unwrap());

    let again = store.ensure(&key("StageEvents")).unwrap();
    assert_eq!(again.state, TaskState::Queued, "ensure must not reset an existing row");
    assert_eq!(again.queued_at, Some(at(0)));
}

#[test]
fn transition_is_compare_and_set() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("LoadSongplaysFact");
    store.ensure(&k).unwrap();

    assert!(store
        .transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(0)))
        .unwrap());
    // Second writer still believes the instance is NONE.
    assert!(!store
        .transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(1)))
        .unwrap());

    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.queued_at, Some(at(0)));
    assert_eq!(store.history(&k).unwrap().len(), 1);
}

#[test]
fn edges_outside_the_state_machine_are_rejected() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("End");
    store.ensure(&k).unwrap();

    let err = store
        .transition(&k, TaskState::None, TaskState::Success, TransitionChange::at(at(0)))
        .unwrap_err();
    assert!(matches!(
        err,
        BatchdagError::InvalidTransition {
            from: TaskState::None,
            to: TaskState::Success,
            ..
        }
    ));

    let err = store
        .transition(&k, TaskState::Success, TaskState::Queued, TransitionChange::at(at(0)))
        .unwrap_err();
    assert!(matches!(err, BatchdagError::InvalidTransition { .. }));
    assert_eq!(store.get(&k).unwrap().unwrap().state, TaskState::None);
}

#[test]
fn retry_cycle_records_failure_and_history() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("StageEvents");
    store.ensure(&k).unwrap();

    let failure = FailureRecord {
        kind: FailureKind::Transient,
        reason: "connection reset by peer".to_string(),
    };

    store.transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(0))).unwrap();
    store.transition(&k, TaskState::Queued, TaskState::Running, TransitionChange::at(at(1))).unwrap();
    store
        .transition(
            &k,
            TaskState::Running,
            TaskState::Failed,
            TransitionChange::at(at(2)).with_failure(failure.clone()),
        )
        .unwrap();
    store
        .transition(
            &k,
            TaskState::Failed,
            TaskState::UpForRetry,
            TransitionChange::at(at(2)).eligible_at(at(7)),
        )
        .unwrap();

    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.state, TaskState::UpForRetry);
    assert_eq!(inst.retry_count, 1);
    assert_eq!(inst.attempt(), 2);
    assert_eq!(inst.next_eligible_at, Some(at(7)));
    assert_eq!(inst.failure, Some(failure));

    store.transition(&k, TaskState::UpForRetry, TaskState::Queued, TransitionChange::at(at(7))).unwrap();
    store.transition(&k, TaskState::Queued, TaskState::Running, TransitionChange::at(at(8))).unwrap();
    store.transition(&k, TaskState::Running, TaskState::Success, TransitionChange::at(at(9))).unwrap();

    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.state, TaskState::Success);
    assert_eq!(inst.retry_count, 1);
    assert_eq!(inst.next_eligible_at, None);
    assert_eq!(inst.failure, None);
    assert_eq!(inst.ended_at, Some(at(9)));

    let history = store.history(&k).unwrap();
    let edges: Vec<_> = history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        edges,
        [
            (TaskState::None, TaskState::Queued),
            (TaskState::Queued, TaskState::Running),
            (TaskState::Running, TaskState::Failed),
            (TaskState::Failed, TaskState::UpForRetry),
            (TaskState::UpForRetry, TaskState::Queued),
            (TaskState::Queued, TaskState::Running),
            (TaskState::Running, TaskState::Success),
        ]
    );
    assert_eq!(history[2].reason.as_deref(), Some("connection reset by peer"));
}

#[test]
fn clear_resets_state_but_keeps_history() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("Start");
    store.ensure(&k).unwrap();
    store.transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(0))).unwrap();
    store.transition(&k, TaskState::Queued, TaskState::Running, TransitionChange::at(at(1))).unwrap();
    store.transition(&k, TaskState::Running, TaskState::Success, TransitionChange::at(at(2))).unwrap();

    store.clear(&k, at(30)).unwrap();

    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.state, TaskState::None);
    assert_eq!(inst.retry_count, 0);
    assert_eq!(inst.ended_at, None);

    let history = store.history(&k).unwrap();
    assert_eq!(history.len(), 4);
    let last = history.last().unwrap();
    assert_eq!((last.from, last.to), (TaskState::Success, TaskState::None));

    // Clearing a fresh instance writes nothing.
    store.clear(&k, at(31)).unwrap();
    assert_eq!(store.history(&k).unwrap().len(), 4);
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InstanceStore::open(dir.path().join("state.db")).unwrap());
    let k = key("LoadUserDimension");
    store.ensure(&k).unwrap();
    store.transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(0))).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            let k = k.clone();
            thread::spawn(move || {
                store
                    .transition(&k, TaskState::Queued, TaskState::Running, TransitionChange::at(at(i)))
                    .unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let running_edges = store
        .history(&k)
        .unwrap()
        .into_iter()
        .filter(|t| t.to == TaskState::Running)
        .count();
    assert_eq!(running_edges, 1);
}

#[test]
fn state_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");
    let k = key("RunQualityChecks");

    {
        let store = InstanceStore::open(&path).unwrap();
        store.ensure(&k).unwrap();
        store.transition(&k, TaskState::None, TaskState::UpstreamFailed, TransitionChange::at(at(3))
            .with_failure(FailureRecord {
                kind: FailureKind::UpstreamFailed,
                reason: "upstream task 'LoadSongplaysFact' ended FAILED".to_string(),
            }))
            .unwrap();
    }

    let store = InstanceStore::open(&path).unwrap();
    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.state, TaskState::UpstreamFailed);
    assert_eq!(
        inst.failure.map(|f| f.kind),
        Some(FailureKind::UpstreamFailed)
    );
}

#[test]
fn successful_dates_need_every_task_done() {
    let store = InstanceStore::open_in_memory().unwrap();
    let finish = |task: &str, day: &str, end: TaskState| {
        let k = InstanceKey::new("sparkify", task, date(day));
        store.ensure(&k).unwrap();
        store.transition(&k, TaskState::None, TaskState::Queued, TransitionChange::at(at(0))).unwrap();
        store.transition(&k, TaskState::Queued, TaskState::Running, TransitionChange::at(at(0))).unwrap();
        store.transition(&k, TaskState::Running, end, TransitionChange::at(at(1))).unwrap();
    };

    finish("A", "2018-11-01", TaskState::Success);
    finish("B", "2018-11-01", TaskState::Skipped);
    finish("A", "2018-11-02", TaskState::Success);
    finish("B", "2018-11-02", TaskState::Failed);
    finish("A", "2018-11-03", TaskState::Success);

    assert_eq!(
        store.successful_dates("sparkify", 2).unwrap(),
        [date("2018-11-01")]
    );
}

fn running(store: &InstanceStore, k: &InstanceKey) {
    store.ensure(k).unwrap();
    for (from, to) in [(TaskState::None, TaskState::Queued), (TaskState::Queued, TaskState::Running)] {
        assert!(store.transition(k, from, to, TransitionChange::at(at(0))).unwrap());
    }
}

#[test]
fn failure_and_retry_scheduling_commit_together() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("StageEvents");
    running(&store, &k);

    let failure = FailureRecord {
        kind: FailureKind::Transient,
        reason: "transient failure: timeout".into(),
    };
    let hops = [
        (TaskState::Failed, TransitionChange::at(at(1)).with_failure(failure.clone())),
        (
            TaskState::UpForRetry,
            TransitionChange::at(at(1)).with_reason("transient failure: timeout").eligible_at(at(6)),
        ),
    ];
    assert!(store.transition_chain(&k, TaskState::Running, &hops).unwrap());

    let inst = store.get(&k).unwrap().unwrap();
    assert_eq!(inst.state, TaskState::UpForRetry);
    assert_eq!(inst.retry_count, 1);
    assert_eq!(inst.next_eligible_at, Some(at(6)));
    assert_eq!(inst.failure, Some(failure));

    let tail: Vec<_> = store
        .history(&k)
        .unwrap()
        .into_iter()
        .skip(2)
        .map(|t| (t.from, t.to, t.retry_count))
        .collect();
    assert_eq!(
        tail,
        [
            (TaskState::Running, TaskState::Failed, 0),
            (TaskState::Failed, TaskState::UpForRetry, 1),
        ]
    );

    // Lost compare-and-set: nothing of the chain is applied.
    assert!(!store.transition_chain(&k, TaskState::Running, &hops).unwrap());
    assert_eq!(store.history(&k).unwrap().len(), 4);
}

#[test]
fn chain_with_an_illegal_hop_changes_nothing() {
    let store = InstanceStore::open_in_memory().unwrap();
    let k = key("LoadSongplaysFact");
    running(&store, &k);

    let err = store
        .transition_chain(
            &k,
            TaskState::Running,
            &[
                (TaskState::Failed, TransitionChange::at(at(1))),
                (TaskState::Queued, TransitionChange::at(at(1))),
            ],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BatchdagError::InvalidTransition {
            from: TaskState::Failed,
            to: TaskState::Queued,
            ..
        }
    ));

    assert_eq!(store.get(&k).unwrap().unwrap().state, TaskState::Running);
    assert_eq!(store.history(&k).unwrap().len(), 2);
}
