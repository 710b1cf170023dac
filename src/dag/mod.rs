//! Dependency scheduling with layered parallel execution.
//!
//! This module turns an unordered task set with declared dependencies into a
//! safe, parallel, fault-tolerant execution schedule.
//!
//! ## Architecture
//!
//! 1. **Graph** - Stores tasks and edges, detects cycles, computes layers
//! 2. **Scheduler** - Tracks per-task lifecycle and the live ready set
//! 3. **Controller** - Runs ready tasks through a bounded queue, validates
//!    results and applies repairs before giving up on a task
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use taskweave::dag::{ControllerConfig, ExecutionController, ExecutionResult, Executor, TaskNode};
//!
//! struct Shell;
//!
//! #[async_trait]
//! impl Executor<String> for Shell {
//!     async fn execute(&self, task: &TaskNode<String>) -> anyhow::Result<ExecutionResult> {
//!         Ok(ExecutionResult::success(&task.id, serde_json::json!(task.payload), Duration::ZERO))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tasks = vec![
//!     TaskNode::new("setup", "prepare workspace".to_string()),
//!     TaskNode::new("core", "write core".to_string()).with_dependencies(["setup"]),
//!     TaskNode::new("tests", "write tests".to_string()).with_dependencies(["setup"]),
//!     TaskNode::new("docs", "write docs".to_string()).with_dependencies(["core", "tests"]),
//! ];
//!
//! let controller = ExecutionController::<String>::new(ControllerConfig::default(), Arc::new(Shell));
//! let summary = controller.run(tasks).await?;
//! // Layer 0: [setup]
//! // Layer 1: [core, tests]
//! // Layer 2: [docs]
//! assert!(summary.success());
//! # Ok(())
//! # }
//! ```

mod collaborators;
mod controller;
mod graph;
mod scheduler;
mod state;

pub use collaborators::{AcceptSuccessful, Executor, NoRepair, Repairer, TracedExecutor, Validator};
pub use controller::{ControllerConfig, ControllerEvent, ExecutionController};
pub use graph::{DependencyGraph, TaskNode};
pub use scheduler::{ScheduleResult, Scheduler};
pub use state::{ExecutionResult, ExecutionState, ExecutionTimer, RunState, RunSummary, Validation};

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tasks() -> Vec<TaskNode<&'static str>> {
        vec![
            TaskNode::new("A", "setup"),
            TaskNode::new("B", "core a").with_dependencies(["A"]),
            TaskNode::new("C", "core b").with_dependencies(["A"]),
            TaskNode::new("D", "integration").with_dependencies(["B", "C"]),
        ]
    }

    #[test]
    fn test_plan_construction() {
        let scheduler = Scheduler::from_tasks(create_test_tasks()).unwrap();
        assert_eq!(scheduler.task_count(), 4);
    }

    #[test]
    fn test_layer_computation() {
        let scheduler = Scheduler::from_tasks(create_test_tasks()).unwrap();
        let plan = scheduler.get_execution_plan();

        // Layer 0: A (no dependencies)
        assert_eq!(plan.layers.len(), 3);
        assert_eq!(plan.layers[0], vec!["A"]);
        // Layer 1: B and C (both depend only on A)
        assert!(plan.layers[1].contains(&"B".to_string()));
        assert!(plan.layers[1].contains(&"C".to_string()));
        // Layer 2: D (depends on B and C)
        assert_eq!(plan.layers[2], vec!["D"]);
    }

    #[test]
    fn test_cycle_detection() {
        // A -> B -> C -> A
        let tasks = vec![
            TaskNode::new("A", "a").with_dependencies(["C"]),
            TaskNode::new("B", "b").with_dependencies(["A"]),
            TaskNode::new("C", "c").with_dependencies(["B"]),
        ];

        let plan = Scheduler::from_tasks(tasks).unwrap().get_execution_plan();
        assert!(plan.has_cycle);
        assert!(plan.layers.is_empty());
        assert_eq!(plan.cycle_nodes.len(), 3);
    }
}
