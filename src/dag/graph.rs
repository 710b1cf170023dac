//! Dependency graph storage, cycle detection and layered ordering.
//!
//! Edges point from a prerequisite to its dependent: `a -> b` means `a` must
//! complete before `b` may start. In-degree counts the unresolved
//! prerequisites of a node and is the only gate the scheduler consults.

use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// A unit of work with its declared prerequisites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode<P> {
    /// Identifier, unique within one scheduling session
    pub id: String,
    /// Ids of the tasks that must complete first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Opaque work description handed to the executor
    pub payload: P,
    /// Dispatch priority; higher runs first
    #[serde(default)]
    pub priority: i32,
}

impl<P> TaskNode<P> {
    /// Create a task with no dependencies.
    pub fn new(id: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            dependencies: BTreeSet::new(),
            payload,
            priority: 0,
        }
    }

    /// Declare the tasks this one depends on.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check whether this task declares `id` as a prerequisite.
    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.contains(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Mutable directed graph of tasks.
#[derive(Debug, Clone)]
pub struct DependencyGraph<P> {
    /// Nodes by id
    nodes: HashMap<String, TaskNode<P>>,
    /// Ids keyed by insertion sequence
    order: BTreeMap<u64, String>,
    /// Insertion sequence per id
    index: HashMap<String, u64>,
    next_index: u64,
    /// Forward edges: id -> tasks that depend on it
    successors: HashMap<String, HashSet<String>>,
    /// Unresolved prerequisite count per id
    in_degree: HashMap<String, usize>,
}

impl<P> Default for DependencyGraph<P> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            order: BTreeMap::new(),
            index: HashMap::new(),
            next_index: 0,
            successors: HashMap::new(),
            in_degree: HashMap::new(),
        }
    }
}

impl<P> DependencyGraph<P> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check whether a node with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get a node by id.
    pub fn get(&self, id: &str) -> Option<&TaskNode<P>> {
        self.nodes.get(id)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.values().map(String::as_str)
    }

    /// Current in-degree of a node.
    pub fn in_degree(&self, id: &str) -> Option<usize> {
        self.in_degree.get(id).copied()
    }

    /// Direct dependents of a node, sorted by id.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .successors
            .get(id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.successors.values().map(HashSet::len).sum()
    }

    /// Nodes whose in-degree is currently zero, in insertion order.
    pub fn roots(&self) -> Vec<&str> {
        self.node_ids()
            .filter(|id| self.in_degree(id) == Some(0))
            .collect()
    }

    /// Add a node. Edges are not derived until `add_edge` or
    /// `build_from_dependencies` is called.
    pub fn add_node(&mut self, node: TaskNode<P>) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { id: node.id });
        }
        let id = node.id.clone();
        self.successors.insert(id.clone(), HashSet::new());
        self.in_degree.insert(id.clone(), 0);
        self.order.insert(self.next_index, id.clone());
        self.index.insert(id.clone(), self.next_index);
        self.next_index += 1;
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Add the edge `from -> to`. Adding an existing edge is a no-op.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode { id: id.to_string() });
            }
        }
        if from == to {
            return Err(GraphError::InvalidEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let inserted = self
            .successors
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        if inserted {
            *self.in_degree.entry(to.to_string()).or_insert(0) += 1;
            if let Some(node) = self.nodes.get_mut(to) {
                node.dependencies.insert(from.to_string());
            }
        }
        Ok(())
    }

    /// Derive edges from every node's declared dependencies.
    ///
    /// Dependencies naming ids outside the graph are treated as already
    /// satisfied and skipped.
    pub fn build_from_dependencies(&mut self) -> Result<(), GraphError> {
        let mut edges = Vec::new();
        for id in self.order.values() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    debug!(task = %id, dependency = %dep, "Skipping dependency outside the task set");
                    continue;
                }
                edges.push((dep.clone(), id.clone()));
            }
        }

        for (from, to) in edges {
            self.add_edge(&from, &to)?;
        }
        Ok(())
    }

    /// Check for a cycle anywhere in the graph, including disconnected parts.
    pub fn has_cycle(&self) -> bool {
        self.first_cycle().is_some()
    }

    /// Ids forming the first cycle found, in path order. Empty if acyclic.
    pub fn find_cycle_nodes(&self) -> Vec<String> {
        self.first_cycle().unwrap_or_default()
    }

    /// Compute execution layers with Kahn's algorithm.
    ///
    /// Layer `k + 1` holds the successors of layer `k` whose last unresolved
    /// prerequisite was in layer `k`. Nodes within a layer keep insertion
    /// order. The graph itself is left untouched.
    pub fn topological_sort(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = self
            .in_degree
            .iter()
            .map(|(id, degree)| (id.as_str(), *degree))
            .collect();
        let mut current = self.roots();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for id in &current {
                for succ in self.successors.get(*id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(succ.as_str())
                        && *degree > 0
                    {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(succ.as_str());
                        }
                    }
                }
            }
            next.sort_by_key(|id| self.index.get(*id).copied().unwrap_or(u64::MAX));

            placed += current.len();
            layers.push(current.into_iter().map(str::to_string).collect());
            current = next;
        }

        if placed < self.len() {
            let nodes = self
                .node_ids()
                .filter(|id| in_degree.get(id).copied().unwrap_or(0) > 0)
                .map(str::to_string)
                .collect();
            return Err(GraphError::CyclicGraph { nodes });
        }
        Ok(layers)
    }

    /// Remove a node, releasing its dependents. No-op if absent.
    pub fn remove_node(&mut self, id: &str) -> Option<TaskNode<P>> {
        let node = self.nodes.remove(id)?;
        if let Some(index) = self.index.remove(id) {
            self.order.remove(&index);
        }
        self.in_degree.remove(id);

        if let Some(dependents) = self.successors.remove(id) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        // Every in-graph predecessor is recorded in the node's dependencies.
        for dep in &node.dependencies {
            if let Some(set) = self.successors.get_mut(dep) {
                set.remove(id);
            }
        }

        Some(node)
    }

    /// Drop every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.index.clear();
        self.next_index = 0;
        self.successors.clear();
        self.in_degree.clear();
    }

    /// Three-colour DFS with an explicit stack of `(id, pending successors)`
    /// frames. The stack doubles as the current path.
    fn first_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.len());

        for start in self.node_ids() {
            if marks.contains_key(start) {
                continue;
            }
            marks.insert(start, Mark::OnPath);
            let mut stack = vec![(start, self.successors(start).into_iter())];

            while let Some((id, pending)) = stack.last_mut() {
                let id = *id;
                let Some(next) = pending.next() else {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                };

                match marks.get(next) {
                    Some(Mark::OnPath) => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        return Some(stack[from..].iter().map(|(n, _)| n.to_string()).collect());
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::OnPath);
                        stack.push((next, self.successors(next).into_iter()));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: Vec<&str>) -> TaskNode<()> {
        TaskNode::new(id, ()).with_dependencies(deps)
    }

    fn graph(tasks: Vec<TaskNode<()>>) -> DependencyGraph<()> {
        let mut graph = DependencyGraph::new();
        for t in tasks {
            graph.add_node(t).unwrap();
        }
        graph.build_from_dependencies().unwrap();
        graph
    }

    fn assert_valid_layering(graph: &DependencyGraph<()>) {
        let layers = graph.topological_sort().unwrap();
        let mut layer_of = HashMap::new();
        for (i, layer) in layers.iter().enumerate() {
            for id in layer {
                assert!(layer_of.insert(id.clone(), i).is_none(), "{id} appears twice");
            }
        }
        assert_eq!(layer_of.len(), graph.len());
        for from in graph.node_ids() {
            for to in graph.successors(from) {
                assert!(layer_of[from] < layer_of[to], "edge {from} -> {to} not ordered");
            }
        }
    }

    #[test]
    fn test_diamond_layers() {
        let g = graph(vec![
            task("A", vec![]),
            task("B", vec!["A"]),
            task("C", vec!["A"]),
            task("D", vec!["B", "C"]),
        ]);

        let layers = g.topological_sort().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["A"]);
        assert!(layers[1].contains(&"B".to_string()));
        assert!(layers[1].contains(&"C".to_string()));
        assert_eq!(layers[2], vec!["D"]);
    }

    #[test]
    fn test_layering_respects_every_edge() {
        assert_valid_layering(&graph(vec![
            task("a", vec![]),
            task("b", vec!["a"]),
            task("c", vec!["b"]),
            task("d", vec!["a", "c"]),
            task("e", vec![]),
            task("f", vec!["e", "b"]),
        ]));
        assert_valid_layering(&graph(vec![
            task("x", vec![]),
            task("y", vec![]),
            task("z", vec![]),
        ]));
        assert_valid_layering(&graph(vec![]));
    }

    #[test]
    fn test_layer_keeps_insertion_order() {
        let g = graph(vec![
            task("root", vec![]),
            task("zeta", vec!["root"]),
            task("alpha", vec!["root"]),
            task("mid", vec!["root"]),
        ]);
        let layers = g.topological_sort().unwrap();
        assert_eq!(layers[1], vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_add_edge_is_idempotent() {
        let mut g = graph(vec![task("a", vec![]), task("b", vec![])]);
        g.add_edge("a", "b").unwrap();
        g.add_edge("a", "b").unwrap();
        assert_eq!(g.in_degree("b"), Some(1));
        assert_eq!(g.edge_count(), 1);
        assert!(g.get("b").unwrap().depends_on("a"));
    }

    #[test]
    fn test_add_edge_rejects_unknown_and_self() {
        let mut g = graph(vec![task("a", vec![])]);
        assert_eq!(
            g.add_edge("a", "ghost"),
            Err(GraphError::UnknownNode { id: "ghost".into() })
        );
        assert_eq!(
            g.add_edge("a", "a"),
            Err(GraphError::InvalidEdge {
                from: "a".into(),
                to: "a".into()
            })
        );
    }

    #[test]
    fn test_duplicate_node() {
        let mut g = DependencyGraph::new();
        g.add_node(task("a", vec![])).unwrap();
        let err = g.add_node(task("a", vec![])).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_self_dependency_is_rejected_on_build() {
        let mut g = DependencyGraph::new();
        g.add_node(task("a", vec!["a"])).unwrap();
        assert!(matches!(
            g.build_from_dependencies(),
            Err(GraphError::InvalidEdge { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_is_skipped() {
        let g = graph(vec![task("a", vec!["external"]), task("b", vec!["a"])]);
        assert_eq!(g.in_degree("a"), Some(0));
        assert_eq!(g.in_degree("b"), Some(1));
        assert_eq!(g.roots(), vec!["a"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph(vec![task("X", vec!["Y"]), task("Y", vec!["X"])]);
        assert!(g.has_cycle());
        let mut cycle = g.find_cycle_nodes();
        cycle.sort();
        assert_eq!(cycle, vec!["X", "Y"]);
        assert!(matches!(
            g.topological_sort(),
            Err(GraphError::CyclicGraph { .. })
        ));
    }

    #[test]
    fn test_cycle_excludes_tail_nodes() {
        // entry -> a -> b -> c -> a
        let g = graph(vec![
            task("entry", vec![]),
            task("a", vec!["entry", "c"]),
            task("b", vec!["a"]),
            task("c", vec!["b"]),
        ]);
        let mut cycle = g.find_cycle_nodes();
        cycle.sort();
        assert_eq!(cycle, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_in_disconnected_component() {
        let g = graph(vec![
            task("ok1", vec![]),
            task("ok2", vec!["ok1"]),
            task("p", vec!["q"]),
            task("q", vec!["p"]),
        ]);
        assert!(g.has_cycle());
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle_nodes() {
        let g = graph(vec![task("a", vec![]), task("b", vec!["a"])]);
        assert!(!g.has_cycle());
        assert!(g.find_cycle_nodes().is_empty());
    }

    #[test]
    fn test_remove_node_releases_successors() {
        let mut g = graph(vec![
            task("a", vec![]),
            task("b", vec!["a"]),
            task("c", vec!["a", "b"]),
        ]);
        assert_eq!(g.in_degree("c"), Some(2));

        let removed = g.remove_node("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(g.in_degree("b"), Some(0));
        assert_eq!(g.in_degree("c"), Some(1));
        assert!(!g.contains("a"));
        assert_eq!(g.roots(), vec!["b"]);
    }

    #[test]
    fn test_remove_node_detaches_from_predecessors() {
        let mut g = graph(vec![task("a", vec![]), task("b", vec!["a"])]);
        g.remove_node("b");
        assert!(g.successors("a").is_empty());
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_remove_absent_node_is_noop() {
        let mut g = graph(vec![task("a", vec![])]);
        assert!(g.remove_node("missing").is_none());
        assert_eq!(g.len(), 1);
    }

    fn chain(len: usize) -> DependencyGraph<()> {
        let mut g = DependencyGraph::new();
        for i in 0..len {
            let node = TaskNode::new(format!("t{i}"), ());
            let node = if i == 0 {
                node
            } else {
                node.with_dependencies([format!("t{}", i - 1)])
            };
            g.add_node(node).unwrap();
        }
        g.build_from_dependencies().unwrap();
        g
    }

    #[test]
    fn test_long_chain_is_acyclic() {
        let g = chain(100_000);
        assert!(!g.has_cycle());
        assert!(g.find_cycle_nodes().is_empty());

        let layers = g.topological_sort().unwrap();
        assert_eq!(layers.len(), 100_000);
        assert_eq!(layers[0], vec!["t0"]);
        assert_eq!(layers[99_999], vec!["t99999"]);
    }

    #[test]
    fn test_cycle_at_end_of_long_chain() {
        let mut g = chain(20_000);
        g.add_edge("t19999", "t19990").unwrap();

        let mut cycle = g.find_cycle_nodes();
        assert_eq!(cycle.len(), 10);
        cycle.sort();
        assert_eq!(cycle.first().map(String::as_str), Some("t19990"));

        match g.topological_sort() {
            Err(GraphError::CyclicGraph { nodes }) => assert_eq!(nodes.len(), 10),
            other => panic!("Expected CyclicGraph, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_node_keeps_remaining_order() {
        let mut g = graph(vec![
            task("a", vec![]),
            task("b", vec![]),
            task("c", vec!["a"]),
            task("d", vec![]),
        ]);
        g.remove_node("b");
        assert_eq!(g.node_ids().collect::<Vec<_>>(), vec!["a", "c", "d"]);
        assert_eq!(g.topological_sort().unwrap(), vec![vec!["a", "d"], vec!["c"]]);

        g.remove_node("a");
        assert_eq!(g.roots(), vec!["c", "d"]);
    }

    #[test]
    fn test_topological_sort_does_not_consume_graph() {
        let g = graph(vec![task("a", vec![]), task("b", vec!["a"])]);
        let first = g.topological_sort().unwrap();
        let second = g.topological_sort().unwrap();
        assert_eq!(first, second);
        assert_eq!(g.in_degree("b"), Some(1));
    }
}
