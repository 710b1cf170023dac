//! Typed error hierarchy for taskweave.
//!
//! Four enums cover the subsystems:
//! - `GraphError`: dependency graph construction and ordering
//! - `QueueError`: a single job inside the concurrent task queue
//! - `ControllerError`: failures that refuse a whole run
//! - `ConfigError`: invalid configuration values

use std::time::Duration;
use thiserror::Error;

/// Errors from building or ordering the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate task id: {id}")]
    DuplicateNode { id: String },

    #[error("Unknown task id: {id}")]
    UnknownNode { id: String },

    #[error("Invalid edge {from} -> {to}: a task cannot depend on itself")]
    InvalidEdge { from: String, to: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {nodes:?}")]
    CyclicGraph { nodes: Vec<String> },
}

/// Errors from a job submitted to the concurrent task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task timed out after {}ms", timeout.as_millis())]
    TaskTimeout { timeout: Duration },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Queue dropped the task before it was dispatched")]
    Closed,
}

/// Errors that refuse a run before any task executes.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Cyclic dependency between tasks: {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },

    #[error("Invalid task graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Errors from validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}
