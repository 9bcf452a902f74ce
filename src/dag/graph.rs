// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::task::{TaskDefinition, TaskId};
use crate::errors::StructuralError;

/// Internal node structure: stores immediate upstream and downstream indices.
#[derive(Debug, Clone, Default)]
struct DagNode {
    upstream: Vec<usize>,
    downstream: Vec<usize>,
}

/// Validated, immutable DAG of Task Definitions.
///
/// Construction fails fast with a [`StructuralError`] on duplicates,
/// dangling references, self-dependencies or cycles. After that the graph
/// only answers questions: topological order (ties broken by declaration
/// order) and direct upstream/downstream sets.
#[derive(Debug, Clone)]
pub struct DagGraph {
    dag_id: String,
    tasks: Vec<Arc<TaskDefinition>>,
    index: HashMap<TaskId, usize>,
    nodes: Vec<DagNode>,
    order: Vec<usize>,
}

impl DagGraph {
    pub fn new(
        dag_id: impl Into<String>,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Self, StructuralError> {
        if definitions.is_empty() {
            return Err(StructuralError::Empty);
        }

        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if index.insert(def.id.clone(), i).is_some() {
                return Err(StructuralError::DuplicateTask(def.id.clone()));
            }
        }

        let mut nodes = vec![DagNode::default(); definitions.len()];
        for (i, def) in definitions.iter().enumerate() {
            let mut seen = HashSet::new();
            for up in &def.upstream {
                if up == &def.id {
                    return Err(StructuralError::SelfDependency(def.id.clone()));
                }
                let Some(&j) = index.get(up) else {
                    return Err(StructuralError::UnknownUpstream {
                        task: def.id.clone(),
                        upstream: up.clone(),
                    });
                };
                if seen.insert(j) {
                    nodes[i].upstream.push(j);
                    nodes[j].downstream.push(i);
                }
            }
        }

        detect_cycle(&definitions, &nodes)?;
        let order = stable_topological_order(&nodes);

        Ok(Self {
            dag_id: dag_id.into(),
            tasks: definitions.into_iter().map(Arc::new).collect(),
            index,
            nodes,
            order,
        })
    }

    pub fn dag_id(&self) -> &str {
        &self.dag_id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Arc<TaskDefinition>> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.tasks.iter()
    }

    /// Every task exactly once, each after all of its upstream tasks.
    pub fn topological_order(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.order.iter().map(|&i| &self.tasks[i])
    }

    /// Position of `id` in [`Self::topological_order`].
    pub fn topological_position(&self, id: &str) -> Option<usize> {
        let i = *self.index.get(id)?;
        self.order.iter().position(|&o| o == i)
    }

    /// Direct upstream tasks of `id`.
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, |n| &n.upstream)
    }

    /// Direct downstream tasks of `id`.
    pub fn downstream_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, |n| &n.downstream)
    }

    /// Tasks with no upstream.
    pub fn start_tasks(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.upstream.is_empty())
            .map(|(i, _)| self.tasks[i].id.as_str())
            .collect()
    }

    fn neighbours(&self, id: &str, edges: impl Fn(&DagNode) -> &Vec<usize>) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                edges(&self.nodes[i])
                    .iter()
                    .map(|&j| self.tasks[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn detect_cycle(definitions: &[TaskDefinition], nodes: &[DagNode]) -> Result<(), StructuralError> {
    // Edge direction: upstream -> task.
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..nodes.len() {
        graph.add_node(i);
    }
    for (i, node) in nodes.iter().enumerate() {
        for &up in &node.upstream {
            graph.add_edge(up, i, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(StructuralError::Cycle(
            definitions[cycle.node_id()].id.clone(),
        )),
    }
}

/// Kahn's algorithm; among ready tasks the earliest declared goes first.
fn stable_topological_order(nodes: &[DagNode]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.upstream.len()).collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &down in &nodes[i].downstream {
            in_degree[down] -= 1;
            if in_degree[down] == 0 {
                ready.insert(down);
            }
        }
    }

    order
}
