//! Execution controller: layered parallel execution with validation and repair.
//!
//! The controller plans a run once, then walks the plan layer by layer. Each
//! round dispatches the scheduler's live ready set through a bounded queue and
//! drives every task through its execute / validate / repair loop. Task
//! failures are recorded and never abort sibling branches; only a cyclic or
//! malformed task graph refuses the run.

use crate::dag::collaborators::{AcceptSuccessful, Executor, NoRepair, Repairer, Validator};
use crate::dag::graph::TaskNode;
use crate::dag::scheduler::Scheduler;
use crate::dag::state::{ExecutionResult, ExecutionTimer, RunState, RunSummary, Validation};
use crate::errors::{ConfigError, ControllerError};
use crate::queue::{ConcurrentTaskQueue, run_detached};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the execution controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum tasks executing at once
    pub max_concurrent: usize,
    /// Repairs allowed per task before it fails
    pub max_retries: u32,
    /// Per-execution timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 2,
            task_timeout_ms: None,
        }
    }
}

impl ControllerConfig {
    /// Set the concurrency limit.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-execution timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// The per-execution timeout, if any.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.task_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "task_timeout_ms".to_string(),
                message: "must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Planning succeeded and execution is about to start.
    RunStarted {
        run_id: Uuid,
        layers: Vec<Vec<String>>,
    },
    /// A round of ready tasks is being dispatched.
    LayerStarted {
        layer: usize,
        tasks: Vec<String>,
    },
    /// A task attempt was handed to the executor.
    TaskStarted {
        task_id: String,
        layer: usize,
        attempt: u32,
    },
    /// The validator returned a verdict.
    TaskValidated {
        task_id: String,
        attempt: u32,
        valid: bool,
        issues: Vec<String>,
    },
    /// A repaired payload was accepted.
    TaskRepaired {
        task_id: String,
        next_attempt: u32,
    },
    /// A task reached a terminal state.
    TaskFinished {
        task_id: String,
        result: Box<ExecutionResult>,
    },
    /// Every task of a round has settled.
    LayerCompleted {
        layer: usize,
        completed: usize,
        failed: usize,
    },
    /// The run finished.
    RunCompleted {
        success: bool,
        summary: Box<RunSummary>,
    },
}

/// Drives a task set through planning, execution, validation and repair.
pub struct ExecutionController<P: Send + Sync> {
    config: ControllerConfig,
    executor: Arc<dyn Executor<P>>,
    validator: Arc<dyn Validator<P>>,
    repairer: Arc<dyn Repairer<P>>,
    event_tx: Option<mpsc::Sender<ControllerEvent>>,
    state: std::sync::Mutex<RunState>,
}

impl<P> ExecutionController<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a controller that accepts successful results and never repairs.
    pub fn new(config: ControllerConfig, executor: Arc<dyn Executor<P>>) -> Self {
        Self {
            config,
            executor,
            validator: Arc::new(AcceptSuccessful),
            repairer: Arc::new(NoRepair),
            event_tx: None,
            state: std::sync::Mutex::new(RunState::Idle),
        }
    }

    /// Set the validator.
    pub fn with_validator(mut self, validator: Arc<dyn Validator<P>>) -> Self {
        self.validator = validator;
        self
    }

    /// Set the repairer.
    pub fn with_repairer(mut self, repairer: Arc<dyn Repairer<P>>) -> Self {
        self.repairer = repairer;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ControllerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute a task set to completion.
    ///
    /// Returns a summary whenever planning succeeds, regardless of how many
    /// tasks fail. A cyclic or malformed graph refuses the run before any
    /// task executes.
    pub async fn run(&self, tasks: Vec<TaskNode<P>>) -> Result<RunSummary, ControllerError> {
        self.config.validate()?;
        let timer = ExecutionTimer::start();
        let started_at = Utc::now();
        self.set_state(RunState::Planning);

        let scheduler = match Scheduler::from_tasks(tasks) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.set_state(RunState::Failed);
                return Err(e.into());
            }
        };

        let plan = scheduler.get_execution_plan();
        if plan.has_cycle {
            warn!(nodes = ?plan.cycle_nodes, "Refusing run with cyclic dependencies");
            self.set_state(RunState::Failed);
            return Err(ControllerError::CyclicDependency {
                nodes: plan.cycle_nodes,
            });
        }

        let mut summary = RunSummary::new(scheduler.task_count(), started_at);
        info!(
            run_id = %summary.run_id,
            tasks = scheduler.task_count(),
            layers = plan.layers.len(),
            max_concurrent = self.config.max_concurrent,
            "Execution plan ready"
        );
        self.emit(ControllerEvent::RunStarted {
            run_id: summary.run_id,
            layers: plan.layers.clone(),
        })
        .await;
        self.set_state(RunState::Executing);

        let scheduler = Mutex::new(scheduler);
        let queue = ConcurrentTaskQueue::new(self.config.max_concurrent);

        for (layer, planned) in plan.layers.iter().enumerate() {
            let ready = scheduler.lock().await.get_next_executable_tasks();
            if ready.is_empty() {
                debug!(layer, "No runnable tasks left");
                break;
            }

            let ids: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
            info!(layer, planned = planned.len(), ready = ids.len(), "Dispatching layer");
            self.emit(ControllerEvent::LayerStarted { layer, tasks: ids }).await;

            let runs = ready
                .into_iter()
                .map(|task| self.run_task(task, layer, &scheduler, &queue));
            let results = join_all(runs).await;

            let mut completed = 0;
            let mut failed = 0;
            for result in results {
                if result.success {
                    completed += 1;
                } else {
                    failed += 1;
                }
                summary.add_result(result);
            }

            self.emit(ControllerEvent::LayerCompleted {
                layer,
                completed,
                failed,
            })
            .await;
        }

        let scheduler = scheduler.into_inner();
        summary.blocked = scheduler.blocked_tasks();
        if !summary.blocked.is_empty() {
            warn!(blocked = ?summary.blocked, "Tasks never ran because a prerequisite failed");
        }

        summary.duration = timer.elapsed();
        summary.state = if summary.success() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        self.set_state(summary.state);

        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            failed = summary.failed,
            blocked = summary.blocked.len(),
            retries = summary.retries,
            duration_ms = summary.duration.as_millis() as u64,
            "Run finished"
        );
        self.emit(ControllerEvent::RunCompleted {
            success: summary.success(),
            summary: Box::new(summary.clone()),
        })
        .await;

        Ok(summary)
    }

    /// Run one task through the bounded execute / validate / repair loop.
    ///
    /// A queue slot is held for the whole loop, so collaborator calls of all
    /// three kinds count against `max_concurrent`.
    async fn run_task(
        &self,
        mut task: TaskNode<P>,
        layer: usize,
        scheduler: &Mutex<Scheduler<P>>,
        queue: &ConcurrentTaskQueue,
    ) -> ExecutionResult {
        let _permit = match queue.acquire(task.priority).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(task = %task.id, error = %e, "No queue slot for task");
                let result = ExecutionResult::failure(&task.id, &e.to_string(), Duration::ZERO);
                scheduler.lock().await.mark_failed(&task.id);
                self.emit(ControllerEvent::TaskFinished {
                    task_id: task.id.clone(),
                    result: Box::new(result.clone()),
                })
                .await;
                return result;
            }
        };
        let mut attempt: u32 = 1;

        let outcome = loop {
            scheduler.lock().await.mark_executing(&task.id);
            self.emit(ControllerEvent::TaskStarted {
                task_id: task.id.clone(),
                layer,
                attempt,
            })
            .await;

            let mut result = self.execute(&task).await.with_attempts(attempt);
            let verdict = self.validate(&task, &result).await;
            self.emit(ControllerEvent::TaskValidated {
                task_id: task.id.clone(),
                attempt,
                valid: verdict.valid,
                issues: verdict.issues.clone(),
            })
            .await;

            if verdict.valid {
                result.success = true;
                scheduler.lock().await.mark_completed(&task.id);
                debug!(task = %task.id, attempt, "Task validated");
                break result;
            }

            result.success = false;
            if result.error.is_none() {
                result.error = Some(format!("validation failed: {}", verdict.issues.join("; ")));
            }

            if attempt > self.config.max_retries {
                warn!(task = %task.id, attempts = attempt, "Retry budget exhausted");
                break result;
            }

            match self.repair(&task, &result, &verdict.issues).await {
                Some(payload) => {
                    {
                        let mut sched = scheduler.lock().await;
                        sched.replace_payload(&task.id, payload.clone());
                        sched.mark_retrying(&task.id);
                    }
                    task.payload = payload;
                    attempt += 1;
                    debug!(task = %task.id, next_attempt = attempt, "Repair accepted");
                    self.emit(ControllerEvent::TaskRepaired {
                        task_id: task.id.clone(),
                        next_attempt: attempt,
                    })
                    .await;
                }
                None => {
                    warn!(task = %task.id, attempts = attempt, "Task is unrepairable");
                    break result;
                }
            }
        };

        if !outcome.success {
            scheduler.lock().await.mark_failed(&task.id);
        }
        self.emit(ControllerEvent::TaskFinished {
            task_id: task.id.clone(),
            result: Box::new(outcome.clone()),
        })
        .await;
        outcome
    }

    /// Execute on a detached task, turning every kind of failure into data.
    async fn execute(&self, task: &TaskNode<P>) -> ExecutionResult {
        let timer = ExecutionTimer::start();
        let executor = Arc::clone(&self.executor);
        let job = task.clone();

        let outcome = run_detached(
            async move { executor.execute(&job).await },
            self.config.task_timeout(),
        )
        .await;

        match outcome {
            Ok(Ok(mut result)) => {
                result.task_id = task.id.clone();
                if result.duration.is_zero() {
                    result.duration = timer.elapsed();
                }
                result
            }
            Ok(Err(e)) => {
                warn!(task = %task.id, error = %e, "Executor failed");
                ExecutionResult::failure(&task.id, &format!("{e:#}"), timer.elapsed())
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "Execution did not finish");
                ExecutionResult::failure(&task.id, &e.to_string(), timer.elapsed())
            }
        }
    }

    async fn validate(&self, task: &TaskNode<P>, result: &ExecutionResult) -> Validation {
        match self.validator.validate(task, result).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(task = %task.id, error = %e, "Validator failed");
                Validation::rejected([format!("validator error: {e:#}")])
            }
        }
    }

    async fn repair(
        &self,
        task: &TaskNode<P>,
        result: &ExecutionResult,
        issues: &[String],
    ) -> Option<P> {
        match self.repairer.repair(task, result, issues).await {
            Ok(fix) => fix,
            Err(e) => {
                warn!(task = %task.id, error = %e, "Repairer failed");
                None
            }
        }
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Emit an event to the event channel if configured.
    async fn emit(&self, event: ControllerEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
