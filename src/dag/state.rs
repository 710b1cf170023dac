//! Execution state tracking for a scheduling run.
//!
//! This module provides types for tracking the state of a run, including
//! individual task results and the overall run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lifecycle state of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Task is waiting to be dispatched
    #[default]
    Pending,
    /// Task has been handed to the executor
    Executing,
    /// Task validated successfully
    Completed,
    /// Task exhausted its retries or could not be repaired
    Failed,
    /// A repair was accepted and the task awaits re-dispatch
    Retrying,
    /// Task was aborted from outside the run
    Cancelled,
}

impl ExecutionState {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task may be dispatched once its prerequisites clear.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Controller constructed, nothing started
    #[default]
    Idle,
    /// Building the graph and computing layers
    Planning,
    /// Dispatching layers
    Executing,
    /// Every task validated
    Completed,
    /// At least one task failed, or planning was refused
    Failed,
}

impl RunState {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Result of executing a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Task id
    pub task_id: String,
    /// Whether execution reported success
    pub success: bool,
    /// Executor output
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error message if execution failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration of the execution
    #[serde(with = "duration_serde", rename = "duration_ms")]
    pub duration: Duration,
    /// Number of executor invocations the task consumed
    #[serde(default)]
    pub attempts: u32,
}

impl ExecutionResult {
    /// Create a successful result.
    pub fn success(task_id: &str, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            output,
            error: None,
            duration,
            attempts: 0,
        }
    }

    /// Create a failed result.
    pub fn failure(task_id: &str, error: &str, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.to_string()),
            duration,
            attempts: 0,
        }
    }

    /// Record how many attempts produced this result.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Verdict returned by a validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    /// Whether the result is acceptable
    pub valid: bool,
    /// Problems found, handed to the repairer when invalid
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Validation {
    /// An accepting verdict with no issues.
    pub fn passed() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
        }
    }

    /// A rejecting verdict listing its issues.
    pub fn rejected<I, S>(issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid: false,
            issues: issues.into_iter().map(Into::into).collect(),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique id of the run
    pub run_id: Uuid,
    /// When planning started
    pub started_at: DateTime<Utc>,
    /// Total tasks supplied
    pub total_tasks: usize,
    /// Tasks that validated
    pub completed: usize,
    /// Tasks that failed permanently
    pub failed: usize,
    /// Tasks that never ran because a prerequisite did not complete
    #[serde(default)]
    pub blocked: Vec<String>,
    /// Repairs accepted across all tasks
    pub retries: u32,
    /// Total execution time
    #[serde(with = "duration_serde", rename = "duration_ms")]
    pub duration: Duration,
    /// Final state of the run
    pub state: RunState,
    /// Final result for each task that ran
    #[serde(default)]
    pub results: HashMap<String, ExecutionResult>,
}

impl RunSummary {
    /// Create a new empty summary.
    pub fn new(total_tasks: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            total_tasks,
            completed: 0,
            failed: 0,
            blocked: Vec::new(),
            retries: 0,
            duration: Duration::ZERO,
            state: RunState::Idle,
            results: HashMap::new(),
        }
    }

    /// Add a task's final result.
    pub fn add_result(&mut self, result: ExecutionResult) {
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.retries += result.attempts.saturating_sub(1);
        self.results.insert(result.task_id.clone(), result);
    }

    /// A run succeeds when no task failed.
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Get a task's final result.
    pub fn result(&self, task_id: &str) -> Option<&ExecutionResult> {
        self.results.get(task_id)
    }

    /// Get completion percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total_tasks as f64) * 100.0
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
