//! Step dependency graph, topological layering, and readiness queries.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with an
//! edge from each dependency to its dependent. Construction runs a layered
//! topological sort to prove acyclicity; execution is driven by `ready`,
//! which answers "what can start now" from the set of terminal steps.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use pipewright_types::workflow::Step;

use super::definition::WorkflowError;

/// Dependency graph over a workflow's step IDs.
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Dag {
    /// Build the graph from steps and verify it is acyclic.
    pub fn build(steps: &[Step]) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::<String, ()>::with_capacity(steps.len(), 0);
        let mut index = HashMap::with_capacity(steps.len());

        for step in steps {
            if index.contains_key(&step.id) {
                return Err(WorkflowError::Build(format!(
                    "duplicate step ID: '{}'",
                    step.id
                )));
            }
            let node = graph.add_node(step.id.clone());
            index.insert(step.id.clone(), node);
        }

        for step in steps {
            let to = index[&step.id];
            for dep in &step.depends_on {
                let from = index.get(dep).ok_or_else(|| {
                    WorkflowError::Build(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        let dag = Self { graph, index };
        dag.topological_sort()?;
        Ok(dag)
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Group steps into layers where each layer depends only on earlier ones.
    ///
    /// Kahn's algorithm: repeatedly drain every zero in-degree node as one
    /// layer. Layer members keep declaration order.
    pub fn topological_sort(&self) -> Result<Vec<Vec<String>>, WorkflowError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut remaining = self.graph.node_count();
        let mut layers = Vec::new();

        while remaining > 0 {
            let layer: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|n| in_degree[n.index()] == 0)
                .collect();

            if layer.is_empty() {
                let stuck: Vec<&str> = self
                    .graph
                    .node_indices()
                    .filter(|n| in_degree[n.index()] != usize::MAX)
                    .map(|n| self.graph[n].as_str())
                    .collect();
                return Err(WorkflowError::Build(format!(
                    "circular dependency among steps: {}",
                    stuck.join(", ")
                )));
            }

            for &node in &layer {
                // Mark as drained so it is never selected again.
                in_degree[node.index()] = usize::MAX;
                for child in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    in_degree[child.index()] -= 1;
                }
            }
            remaining -= layer.len();
            layers.push(layer.into_iter().map(|n| self.graph[n].clone()).collect());
        }

        Ok(layers)
    }

    /// Steps with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Steps not in `completed` whose dependencies are all in `completed`.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&n| !completed.contains(&self.graph[n]))
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep]))
            })
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Direct dependencies of a step. Empty for unknown IDs.
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Steps that directly depend on `step_id`. Empty for unknown IDs.
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    fn neighbors(&self, step_id: &str, dir: Direction) -> Vec<&str> {
        let Some(&node) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut ids: Vec<(NodeIndex, &str)> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| (n, self.graph[n].as_str()))
            .collect();
        ids.sort_by_key(|(n, _)| n.index());
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, "do something").depends_on(deps.iter().copied())
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sorted(mut ids: Vec<&str>) -> Vec<&str> {
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Layering
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_dependencies_single_layer() {
        let dag = Dag::build(&[step("a", &[]), step("b", &[]), step("c", &[])]).unwrap();
        let layers = dag.topological_sort().unwrap();
        assert_eq!(layers, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_linear_chain_n_layers() {
        let dag = Dag::build(&[step("a", &[]), step("b", &["a"]), step("c", &["b"])]).unwrap();
        let layers = dag.topological_sort().unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_complex_fork_join() {
        //     A
        //    / \
        //   B   C
        //   |   |
        //   D   |
        //    \ /
        //     E
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b"]),
            step("e", &["d", "c"]),
        ];
        let dag = Dag::build(&steps).unwrap();
        let layers = dag.topological_sort().unwrap();
        assert_eq!(
            layers,
            vec![vec!["a"], vec!["b", "c"], vec!["d"], vec!["e"]]
        );
    }

    #[test]
    fn test_layers_cover_all_steps_after_dependencies() {
        let steps = vec![
            step("report", &["merge", "lint"]),
            step("fetch", &[]),
            step("lint", &["fetch"]),
            step("parse", &["fetch"]),
            step("merge", &["parse", "fetch"]),
        ];
        let dag = Dag::build(&steps).unwrap();
        let layers = dag.topological_sort().unwrap();

        let position: HashMap<&str, usize> = layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.iter().map(move |id| (id.as_str(), i)))
            .collect();
        assert_eq!(position.len(), steps.len());
        assert_eq!(layers.iter().map(Vec::len).sum::<usize>(), steps.len());
        for s in &steps {
            for dep in &s.depends_on {
                assert!(position[dep.as_str()] < position[s.id.as_str()]);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Build errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_cycle_detected() {
        let err = Dag::build(&[step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("circular dependency"), "got: {msg}");
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let steps = vec![
            step("root", &[]),
            step("x", &["root", "z"]),
            step("y", &["x"]),
            step("z", &["y"]),
        ];
        let err = Dag::build(&steps).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("circular dependency"), "got: {msg}");
        assert!(!msg.contains("root"), "drained steps are not blamed: {msg}");
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Dag::build(&[step("a", &["missing"])]).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let dag = Dag::build(&[step("a", &[]), step("b", &["a", "a"])]).unwrap();
        assert_eq!(dag.dependencies("b"), vec!["a"]);
        assert_eq!(dag.topological_sort().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_steps() {
        let dag = Dag::build(&[]).unwrap();
        assert!(dag.is_empty());
        assert!(dag.topological_sort().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    #[test]
    fn test_ready_frontier() {
        let dag = Dag::build(&[step("a", &[]), step("b", &["a"]), step("c", &["a"])]).unwrap();
        assert_eq!(dag.ready(&set(&[])), vec!["a"]);
        assert_eq!(sorted(dag.ready(&set(&["a"]))), vec!["b", "c"]);
        assert!(dag.ready(&set(&["a", "b", "c"])).is_empty());
    }

    #[test]
    fn test_ready_waits_for_all_dependencies() {
        let dag = Dag::build(&[
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
        ])
        .unwrap();
        assert_eq!(dag.ready(&set(&["a"])), vec!["b"]);
        assert_eq!(dag.ready(&set(&["a", "b"])), vec!["c"]);
    }

    #[test]
    fn test_roots_and_neighbors() {
        let dag = Dag::build(&[
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
            step("d", &["a"]),
        ])
        .unwrap();
        assert_eq!(dag.roots(), vec!["a", "b"]);
        assert_eq!(dag.dependencies("c"), vec!["a", "b"]);
        assert_eq!(dag.dependents("a"), vec!["c", "d"]);
        assert!(dag.dependencies("nope").is_empty());
        assert_eq!(dag.len(), 4);
    }
}
