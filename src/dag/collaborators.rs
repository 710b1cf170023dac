//! Pluggable collaborators called by the execution controller.
//!
//! The controller never interprets payloads itself. Executing a task, judging
//! its output and proposing a fix are delegated to these traits, which real
//! deployments back with a reasoning provider and tests back with scripts.

use crate::dag::graph::TaskNode;
use crate::dag::state::{ExecutionResult, ExecutionTimer, Validation};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

/// Runs a task. An `Err` is recorded as a failed result, never propagated.
#[async_trait]
pub trait Executor<P: Send + Sync>: Send + Sync {
    async fn execute(&self, task: &TaskNode<P>) -> Result<ExecutionResult>;
}

/// Judges an execution result. An `Err` counts as an invalid verdict.
#[async_trait]
pub trait Validator<P: Send + Sync>: Send + Sync {
    async fn validate(&self, task: &TaskNode<P>, result: &ExecutionResult) -> Result<Validation>;
}

/// Proposes a replacement payload after a failed validation.
///
/// `Ok(None)` declares the task unrepairable; an `Err` is treated the same way.
#[async_trait]
pub trait Repairer<P: Send + Sync>: Send + Sync {
    async fn repair(
        &self,
        task: &TaskNode<P>,
        result: &ExecutionResult,
        issues: &[String],
    ) -> Result<Option<P>>;
}

/// Accepts any result the executor reported as successful.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptSuccessful;

#[async_trait]
impl<P: Send + Sync> Validator<P> for AcceptSuccessful {
    async fn validate(&self, _task: &TaskNode<P>, result: &ExecutionResult) -> Result<Validation> {
        if result.success {
            Ok(Validation::passed())
        } else {
            let issue = result
                .error
                .clone()
                .unwrap_or_else(|| "execution reported failure".to_string());
            Ok(Validation::rejected([issue]))
        }
    }
}

/// Declines every repair, so a task fails on its first invalid result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepair;

#[async_trait]
impl<P: Send + Sync> Repairer<P> for NoRepair {
    async fn repair(
        &self,
        _task: &TaskNode<P>,
        _result: &ExecutionResult,
        _issues: &[String],
    ) -> Result<Option<P>> {
        Ok(None)
    }
}

/// Wraps an executor and records every call as a tracing span.
pub struct TracedExecutor<E> {
    inner: E,
    label: String,
}

impl<E> TracedExecutor<E> {
    /// Wrap `inner`, tagging its spans with `label`.
    pub fn new(inner: E, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    /// Unwrap the decorated executor.
    pub fn into_inner(self) -> E {
        self.inner
    }
}

#[async_trait]
impl<P, E> Executor<P> for TracedExecutor<E>
where
    P: Send + Sync,
    E: Executor<P>,
{
    async fn execute(&self, task: &TaskNode<P>) -> Result<ExecutionResult> {
        let span = info_span!("execute", task = %task.id, executor = %self.label);
        let timer = ExecutionTimer::start();
        let outcome = self.inner.execute(task).instrument(span.clone()).await;
        let elapsed_ms = timer.elapsed().as_millis() as u64;

        match &outcome {
            Ok(result) if result.success => {
                info!(parent: &span, elapsed_ms, "Executor finished");
            }
            Ok(result) => {
                warn!(parent: &span, elapsed_ms, error = ?result.error, "Executor reported failure");
            }
            Err(e) => {
                warn!(parent: &span, elapsed_ms, error = %e, "Executor raised an error");
            }
        }
        outcome
    }
}
