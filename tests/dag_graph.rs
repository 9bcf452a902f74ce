// tests/dag_graph.rs

mod common;
use crate::common::builders::noop_task;

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use batchdag::dag::{DagGraph, TaskDefinition};
use batchdag::errors::StructuralError;

fn ids(graph: &DagGraph) -> Vec<String> {
    graph.topological_order().map(|t| t.id.clone()).collect()
}

#[test]
fn songplays_dag_orders_start_to_end() {
    let graph = DagGraph::new(
        "songplays",
        vec![
            noop_task("End").after("RunQualityChecks"),
            noop_task("RunQualityChecks").after("LoadSongplaysFact"),
            noop_task("LoadSongplaysFact").after("StageEvents"),
            noop_task("StageEvents").after("Start"),
            noop_task("Start"),
        ],
    )
    .expect("valid dag");

    assert_eq!(
        ids(&graph),
        ["Start", "StageEvents", "LoadSongplaysFact", "RunQualityChecks", "End"]
    );
    assert_eq!(graph.start_tasks(), ["Start"]);
    assert_eq!(graph.upstream_of("LoadSongplaysFact"), ["StageEvents"]);
    assert_eq!(graph.downstream_of("LoadSongplaysFact"), ["RunQualityChecks"]);
    assert_eq!(graph.topological_position("End"), Some(4));
}

#[test]
fn independent_tasks_keep_declaration_order() {
    let graph = DagGraph::new(
        "fanout",
        vec![
            noop_task("Start"),
            noop_task("StageSongs").after("Start"),
            noop_task("StageEvents").after("Start"),
            noop_task("LoadUsers").after("StageEvents"),
            noop_task("LoadSongs").after("StageSongs"),
        ],
    )
    .expect("valid dag");

    assert_eq!(
        ids(&graph),
        ["Start", "StageSongs", "StageEvents", "LoadUsers", "LoadSongs"]
    );
}

#[test]
fn duplicate_upstream_edges_are_collapsed() {
    let graph = DagGraph::new(
        "dup",
        vec![noop_task("A"), noop_task("B").after("A").after("A")],
    )
    .expect("valid dag");

    assert_eq!(graph.upstream_of("B"), ["A"]);
    assert_eq!(graph.downstream_of("A"), ["B"]);
}

#[test]
fn cycle_is_rejected() {
    let err = DagGraph::new(
        "cyclic",
        vec![
            noop_task("A").after("C"),
            noop_task("B").after("A"),
            noop_task("C").after("B"),
        ],
    )
    .unwrap_err();

    assert!(matches!(err, StructuralError::Cycle(_)), "got {err:?}");
}

#[test]
fn self_dependency_is_rejected() {
    let err = DagGraph::new("selfish", vec![noop_task("A").after("A")]).unwrap_err();
    assert_eq!(err, StructuralError::SelfDependency("A".to_string()));
}

#[test]
fn unknown_upstream_is_rejected() {
    let err = DagGraph::new("dangling", vec![noop_task("B").after("Ghost")]).unwrap_err();
    assert_eq!(
        err,
        StructuralError::UnknownUpstream {
            task: "B".to_string(),
            upstream: "Ghost".to_string(),
        }
    );
}

#[test]
fn duplicate_task_id_is_rejected() {
    let err = DagGraph::new("dups", vec![noop_task("A"), noop_task("A")]).unwrap_err();
    assert_eq!(err, StructuralError::DuplicateTask("A".to_string()));
}

#[test]
fn empty_dag_is_rejected() {
    let err = DagGraph::new("empty", Vec::<TaskDefinition>::new()).unwrap_err();
    assert_eq!(err, StructuralError::Empty);
}

// Acyclic by construction: task i may only depend on tasks 0..i.
fn random_dag(max_tasks: usize) -> impl Strategy<Value = Vec<(usize, Vec<usize>)>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let deps = if i == 0 {
                            Vec::new()
                        } else {
                            deps.into_iter().map(|d| d % i).collect()
                        };
                        (i, deps)
                    })
                    .collect()
            },
        )
    })
}

proptest! {
    #[test]
    fn topological_order_respects_every_edge(spec in random_dag(12), reverse in any::<bool>()) {
        let mut tasks: Vec<TaskDefinition> = spec
            .iter()
            .map(|(i, deps)| {
                deps.iter().fold(noop_task(&format!("t{i}")), |t, d| t.after(format!("t{d}")))
            })
            .collect();
        if reverse {
            tasks.reverse();
        }

        let graph = DagGraph::new("prop", tasks).expect("acyclic by construction");
        let order = ids(&graph);

        prop_assert_eq!(order.len(), spec.len());
        let unique: HashSet<_> = order.iter().collect();
        prop_assert_eq!(unique.len(), order.len());

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(p, id)| (id.as_str(), p)).collect();
        for (i, deps) in &spec {
            let me = format!("t{i}");
            for d in deps {
                let up = format!("t{d}");
                prop_assert!(position[up.as_str()] < position[me.as_str()],
                    "{} must come before {}", up, me);
            }
        }
    }
}
