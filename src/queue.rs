//! Bounded-concurrency task queue with priority ordering and timeouts.
//!
//! Jobs wait in a priority heap until a running slot is free. A dispatched job
//! runs on its own tokio task; when a timeout elapses the caller stops waiting
//! and gets `QueueError::TaskTimeout`, but the job itself keeps running in the
//! background. The slot is returned as soon as the caller stops waiting.
//!
//! Callers that need a slot across several awaits (execute, then validate,
//! then repair) hold a `QueuePermit` from `acquire` instead of using `add`.

use crate::errors::QueueError;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

/// Generic bounded-concurrency executor.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct ConcurrentTaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<PendingJob>,
    running: usize,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }
}

struct PendingJob {
    priority: i32,
    seq: u64,
    start: oneshot::Sender<Slot>,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A held running slot. Dropping it frees the slot and dispatches the next job.
struct Slot {
    inner: Arc<Inner>,
}

/// A running slot held by the caller. Dropping it frees the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct QueuePermit {
    _slot: Slot,
}

/// Removes a still-queued entry when the waiting caller goes away.
struct Ticket<'a> {
    inner: &'a Arc<Inner>,
    seq: u64,
    waiting: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.waiting {
            return;
        }
        let idle = {
            let mut state = self.inner.lock();
            state.pending.retain(|job| job.seq != self.seq);
            state.is_idle()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.lock();
            state.running = state.running.saturating_sub(1);
            state.is_idle()
        };
        if idle {
            self.inner.idle.notify_waiters();
        } else {
            Inner::dispatch(&self.inner);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(inner: &Arc<Inner>) {
        let mut abandoned = Vec::new();
        {
            let mut state = inner.lock();
            while !state.paused && state.running < inner.max_concurrent {
                let Some(job) = state.pending.pop() else {
                    break;
                };
                state.running += 1;
                let slot = Slot {
                    inner: Arc::clone(inner),
                };
                if let Err(slot) = job.start.send(slot) {
                    // Caller went away while waiting.
                    abandoned.push(slot);
                }
            }
        }
        // Released outside the lock; each drop re-enters dispatch.
        drop(abandoned);
    }
}

impl ConcurrentTaskQueue {
    /// Create a queue running at most `max_concurrent` jobs at once.
    /// A limit of zero is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Maximum number of jobs running at once.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Number of jobs currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Number of jobs waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Check whether dispatching is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Wait for a running slot and hold it until the permit is dropped.
    ///
    /// Slots are granted by descending `priority`, then arrival order.
    /// Dropping the returned future before it resolves leaves no entry behind.
    pub async fn acquire(&self, priority: i32) -> Result<QueuePermit, QueueError> {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut state = self.inner.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(PendingJob {
                priority,
                seq,
                start: tx,
            });
            seq
        };
        let mut ticket = Ticket {
            inner: &self.inner,
            seq,
            waiting: true,
        };
        Inner::dispatch(&self.inner);

        let slot = rx.await.map_err(|_| QueueError::Closed)?;
        ticket.waiting = false;
        Ok(QueuePermit { _slot: slot })
    }

    /// Submit a job and wait for its result.
    ///
    /// Higher `priority` jobs are dispatched first; equal priorities keep
    /// arrival order. With a `timeout`, waiting stops once it elapses even
    /// though the job continues to completion in the background.
    pub async fn add<F, Fut, T>(
        &self,
        job: F,
        priority: i32,
        timeout: Option<Duration>,
    ) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.acquire(priority).await?;
        run_detached(job(), timeout).await
    }

    /// Stop dispatching new jobs. Running jobs are unaffected.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        debug!("Task queue paused");
    }

    /// Resume dispatching.
    pub fn resume(&self) {
        self.inner.lock().paused = false;
        debug!("Task queue resumed");
        Inner::dispatch(&self.inner);
    }

    /// Wait until nothing is running or pending.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Run a future on its own tokio task, waiting at most `timeout` for it.
///
/// On timeout the task keeps running detached. A panic inside the future is
/// reported as `QueueError::TaskPanicked`.
pub async fn run_detached<Fut, T>(future: Fut, timeout: Option<Duration>) -> Result<T, QueueError>
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(future);

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Queued task timed out");
                return Err(QueueError::TaskTimeout { timeout: limit });
            }
        },
        None => handle.await,
    };

    joined.map_err(|e| QueueError::TaskPanicked(e.to_string()))
}
