//! Scheduler for computing execution order and tracking task states.
//!
//! The scheduler owns one dependency graph for the duration of a run. Completing
//! a task removes it from the graph, which is what releases its dependents;
//! failing a task leaves it in place so everything downstream stays blocked.

use crate::dag::graph::{DependencyGraph, TaskNode};
use crate::dag::state::ExecutionState;
use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The execution plan computed from a freshly built graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResult {
    /// Groups of task ids that may run in parallel, in dependency order
    pub layers: Vec<Vec<String>>,
    /// Whether the graph contains a cycle
    pub has_cycle: bool,
    /// Members of the detected cycle, if any
    #[serde(default)]
    pub cycle_nodes: Vec<String>,
}

impl ScheduleResult {
    /// Total number of task ids across all layers.
    pub fn task_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }
}

/// Tracks per-task lifecycle state on top of a dependency graph.
#[derive(Debug)]
pub struct Scheduler<P> {
    /// The underlying graph; shrinks as tasks complete
    graph: DependencyGraph<P>,
    /// Task ids in the order they were added
    order: Vec<String>,
    /// Current payload per task, replaced on repair
    task_map: HashMap<String, P>,
    /// Declared dependencies per task, kept after graph removal
    dependencies: HashMap<String, Vec<String>>,
    /// Lifecycle state per task
    states: HashMap<String, ExecutionState>,
    /// Completed task ids
    completed: HashSet<String>,
    /// Failed task ids
    failed: HashSet<String>,
}

impl<P> Default for Scheduler<P> {
    fn default() -> Self {
        Self {
            graph: DependencyGraph::new(),
            order: Vec::new(),
            task_map: HashMap::new(),
            dependencies: HashMap::new(),
            states: HashMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
        }
    }
}

impl<P: Clone> Scheduler<P> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler from a task set and build its graph.
    pub fn from_tasks(tasks: Vec<TaskNode<P>>) -> Result<Self, GraphError> {
        let mut scheduler = Self::new();
        scheduler.add_tasks(tasks)?;
        scheduler.build_graph()?;
        Ok(scheduler)
    }

    /// Add tasks in `Pending` state.
    pub fn add_tasks<I>(&mut self, tasks: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = TaskNode<P>>,
    {
        for task in tasks {
            let id = task.id.clone();
            let payload = task.payload.clone();
            let deps: Vec<String> = task.dependencies.iter().cloned().collect();
            self.graph.add_node(task)?;
            self.order.push(id.clone());
            self.task_map.insert(id.clone(), payload);
            self.dependencies.insert(id.clone(), deps);
            self.states.insert(id, ExecutionState::Pending);
        }
        Ok(())
    }

    /// Derive graph edges from the declared dependencies.
    pub fn build_graph(&mut self) -> Result<(), GraphError> {
        self.graph.build_from_dependencies()
    }

    /// Compute the layered plan. A cycle is reported, not raised.
    pub fn get_execution_plan(&self) -> ScheduleResult {
        if self.graph.has_cycle() {
            return ScheduleResult {
                layers: Vec::new(),
                has_cycle: true,
                cycle_nodes: self.graph.find_cycle_nodes(),
            };
        }

        match self.graph.topological_sort() {
            Ok(layers) => ScheduleResult {
                layers,
                has_cycle: false,
                cycle_nodes: Vec::new(),
            },
            Err(GraphError::CyclicGraph { nodes }) => ScheduleResult {
                layers: Vec::new(),
                has_cycle: true,
                cycle_nodes: nodes,
            },
            Err(_) => ScheduleResult::default(),
        }
    }

    /// Tasks that may be dispatched right now, in insertion order.
    ///
    /// A task is ready when all its in-graph prerequisites have completed, it
    /// is neither completed nor failed, and its state is `Pending` or
    /// `Retrying`.
    pub fn get_next_executable_tasks(&self) -> Vec<TaskNode<P>> {
        self.graph
            .node_ids()
            .filter(|id| self.graph.in_degree(id) == Some(0))
            .filter(|id| !self.completed.contains(*id) && !self.failed.contains(*id))
            .filter(|id| self.state(id).is_some_and(|s| s.is_dispatchable()))
            .filter_map(|id| self.current_task(id))
            .collect()
    }

    /// Mark a task as handed to the executor.
    pub fn mark_executing(&mut self, id: &str) {
        self.set_state(id, ExecutionState::Executing);
    }

    /// Mark a task as completed and release its dependents.
    pub fn mark_completed(&mut self, id: &str) {
        if !self.states.contains_key(id) {
            return;
        }
        self.failed.remove(id);
        self.completed.insert(id.to_string());
        self.set_state(id, ExecutionState::Completed);
        self.graph.remove_node(id);
    }

    /// Mark a task as failed. Its dependents stay blocked.
    pub fn mark_failed(&mut self, id: &str) {
        if !self.states.contains_key(id) || self.completed.contains(id) {
            return;
        }
        self.failed.insert(id.to_string());
        self.set_state(id, ExecutionState::Failed);
    }

    /// Mark a task for another attempt under the same id.
    pub fn mark_retrying(&mut self, id: &str) {
        if !self.states.contains_key(id) {
            return;
        }
        self.failed.remove(id);
        self.set_state(id, ExecutionState::Retrying);
    }

    /// Abort a task from outside the run. It is never dispatched again and
    /// its dependents stay blocked.
    pub fn mark_cancelled(&mut self, id: &str) {
        if self.state(id).is_some_and(|s| !s.is_terminal()) {
            self.set_state(id, ExecutionState::Cancelled);
        }
    }

    /// Install a repaired payload for a task.
    pub fn replace_payload(&mut self, id: &str, payload: P) {
        if let Some(slot) = self.task_map.get_mut(id) {
            *slot = payload;
        }
    }

    /// Tasks that were never settled and can no longer become ready.
    pub fn blocked_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.state(id).is_some_and(|s| !s.is_terminal()))
            .cloned()
            .collect()
    }

    /// Clear all tasks, states and the underlying graph.
    pub fn reset(&mut self) {
        self.graph.clear();
        self.order.clear();
        self.task_map.clear();
        self.dependencies.clear();
        self.states.clear();
        self.completed.clear();
        self.failed.clear();
    }

    /// Current state of a task.
    pub fn state(&self, id: &str) -> Option<ExecutionState> {
        self.states.get(id).copied()
    }

    /// Current payload of a task.
    pub fn payload(&self, id: &str) -> Option<&P> {
        self.task_map.get(id)
    }

    /// The graph in its current, partially consumed shape.
    pub fn graph(&self) -> &DependencyGraph<P> {
        &self.graph
    }

    /// Get the number of tasks added.
    pub fn task_count(&self) -> usize {
        self.order.len()
    }

    /// Get the number of completed tasks.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Get the number of failed tasks.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Check if every task reached a terminal state.
    pub fn all_settled(&self) -> bool {
        self.states.values().all(ExecutionState::is_terminal)
    }

    fn current_task(&self, id: &str) -> Option<TaskNode<P>> {
        let payload = self.task_map.get(id)?.clone();
        let priority = self.graph.get(id).map_or(0, |n| n.priority);
        let deps = self.dependencies.get(id).cloned().unwrap_or_default();
        Some(
            TaskNode::new(id, payload)
                .with_dependencies(deps)
                .with_priority(priority),
        )
    }

    fn set_state(&mut self, id: &str, state: ExecutionState) {
        if let Some(current) = self.states.get_mut(id) {
            debug!(task = %id, from = ?*current, to = ?state, "Task state change");
            *current = state;
        }
    }
}
