//! Bounded-concurrency job queue.
//!
//! Jobs wait in a priority heap and are spawned onto the tokio runtime while
//! `active < concurrency`. The limit is re-read from the [`ConfigProvider`] on
//! every [`Scheduler::add`] and [`Scheduler::refresh`], so it can be raised or
//! lowered without a restart. Lowering it never preempts running jobs; it only
//! holds back dispatch until enough of them finish.
//!
//! # Ordering
//!
//! * [`QueueStrategy::Fifo`]: every job gets priority `0`; ties are broken by
//!   submission sequence, so jobs start in the order they were added.
//! * [`QueueStrategy::Lifo`]: every job gets the next value of a monotonically
//!   increasing counter and the highest priority waiting job starts next. This
//!   is only approximate LIFO. A running job is never preempted, and a priority
//!   assigned at submission is never revised, so the order only reverses among
//!   jobs that are still waiting.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::config::{ConfigProvider, QueueStrategy};
use crate::error::CoreError;

/// A boxed unit of work. Its error is logged by the scheduler and dropped.
pub type Job = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'static>>;

/// Snapshot of the queue used for admission control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs waiting for a slot.
    pub pending: usize,
    /// Jobs currently executing.
    pub active: usize,
}

impl SchedulerStats {
    pub fn total(&self) -> usize {
        self.pending + self.active
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<dyn ConfigProvider>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<QueuedJob>,
    active: usize,
    limit: usize,
    next_seq: u64,
    lifo_counter: u64,
}

struct QueuedJob {
    priority: u64,
    seq: u64,
    label: String,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the earlier submission.
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

impl State {
    /// Next LIFO priority: strictly increasing, wrapping before overflow and
    /// never `0` (which is reserved for FIFO jobs).
    fn next_lifo_priority(&mut self) -> u64 {
        self.lifo_counter = match self.lifo_counter.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        self.lifo_counter
    }

    /// Pop every job that fits under the current limit, counting it active.
    fn take_ready(&mut self) -> Vec<QueuedJob> {
        let mut ready = Vec::new();
        while self.active < self.limit {
            let Some(job) = self.queue.pop() else { break };
            self.active += 1;
            ready.push(job);
        }
        ready
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Scheduler")
            .field("pending", &stats.pending)
            .field("active", &stats.active)
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        let limit = config.settings().scheduler.effective_concurrency();
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    limit,
                    ..State::default()
                }),
            }),
        }
    }

    /// Queue `job` for execution. Must be called from within a tokio runtime.
    ///
    /// `label` only identifies the job in log lines.
    pub fn add<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let settings = self.inner.config.settings();
        let label = label.into();

        let ready = {
            let mut state = self.inner.lock();
            state.limit = settings.scheduler.effective_concurrency();
            let priority = match settings.scheduler.strategy {
                QueueStrategy::Fifo => 0,
                QueueStrategy::Lifo => state.next_lifo_priority(),
            };
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);

            debug!(
                job = %label,
                priority,
                pending = state.queue.len() + 1,
                active = state.active,
                "job queued"
            );
            state.queue.push(QueuedJob {
                priority,
                seq,
                label,
                job: Box::pin(job),
            });
            state.take_ready()
        };

        self.inner.spawn_all(ready);
    }

    /// Re-read the concurrency limit and start any jobs it now allows.
    pub fn refresh(&self) {
        let limit = self.inner.config.settings().scheduler.effective_concurrency();
        let ready = {
            let mut state = self.inner.lock();
            if state.limit != limit {
                debug!(from = state.limit, to = limit, "scheduler concurrency changed");
            }
            state.limit = limit;
            state.take_ready()
        };
        self.inner.spawn_all(ready);
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.lock();
        SchedulerStats {
            pending: state.queue.len(),
            active: state.active,
        }
    }

    /// The concurrency limit applied at the last `add` or `refresh`.
    pub fn concurrency(&self) -> usize {
        self.inner.lock().limit
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Jobs never run under the lock, so poisoning leaves the state intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_all(self: &Arc<Self>, ready: Vec<QueuedJob>) {
        for queued in ready {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run(queued).await;
            });
        }
    }

    async fn run(self: Arc<Self>, queued: QueuedJob) {
        let QueuedJob { label, job, .. } = queued;
        debug!(job = %label, "job started");

        // The job runs in its own task so a panic surfaces as a JoinError
        // instead of unwinding through the scheduler's bookkeeping.
        match tokio::spawn(job).await {
            Ok(Ok(())) => debug!(job = %label, "job finished"),
            Ok(Err(e)) => error!(job = %label, error = %e, "job failed"),
            Err(join_err) if join_err.is_panic() => {
                error!(job = %label, "job panicked")
            }
            Err(join_err) => error!(job = %label, error = %join_err, "job aborted"),
        }

        let ready = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.take_ready()
        };
        self.spawn_all(ready);
    }
}
