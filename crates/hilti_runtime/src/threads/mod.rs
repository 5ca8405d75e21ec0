//! Worker pool multiplexing virtual threads.
//!
//! A [`ThreadManager`] owns a fixed number of OS worker threads. Every virtual
//! thread id is hashed onto exactly one worker, which runs that vid's jobs in
//! schedule order as a private cooperative scheduler. A job suspends itself by
//! capturing a resume continuation with [`ExecutionContext::yield_with`]; the
//! worker then queues the continuation on itself again.
//!
//! Any error or panic escaping a job cancels the whole pool.

mod context;
mod metrics;
mod queue;
mod worker;

pub use context::{Continuation, ContinuationFn, ExecutionContext, Vid};
pub use metrics::{RuntimeMetrics, RuntimeMetricsSnapshot};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::hash;

use queue::{Job, JobQueue};

/// Lifecycle of a thread manager.
///
/// Only RUN→STOP and RUN→KILL may be requested; both end in DEAD once every
/// worker has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadManagerState {
    Run,
    Stop,
    Kill,
    Dead,
}

impl ThreadManagerState {
    pub const ALL: [ThreadManagerState; 4] = [Self::Run, Self::Stop, Self::Kill, Self::Dead];

    /// Whether a caller may request a move from `self` to `target`.
    pub fn can_transition_to(self, target: ThreadManagerState) -> bool {
        matches!(
            (self, target),
            (Self::Run, Self::Stop) | (Self::Run, Self::Kill)
        )
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Run => 0,
            Self::Stop => 1,
            Self::Kill => 2,
            Self::Dead => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Run,
            1 => Self::Stop,
            2 => Self::Kill,
            _ => Self::Dead,
        }
    }
}

impl fmt::Display for ThreadManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "RUN",
            Self::Stop => "STOP",
            Self::Kill => "KILL",
            Self::Dead => "DEAD",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionStatus {
    Unhandled,
    Handled,
}

/// Failure recorded by a worker whose job returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerException {
    pub vid: Vid,
    pub error: RuntimeError,
    pub status: ExceptionStatus,
}

#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub(crate) queue: JobQueue,
    exception: Mutex<Option<WorkerException>>,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            queue: JobQueue::new(),
            exception: Mutex::new(None),
        }
    }

    fn record_exception(&self, vid: Vid, error: RuntimeError) {
        let mut slot = self.exception.lock();
        // The first failure wins; the worker is cancelled right after it.
        if slot.is_none() {
            *slot = Some(WorkerException {
                vid,
                error,
                status: ExceptionStatus::Unhandled,
            });
        }
    }
}

/// State shared between the manager handle and its worker threads.
#[derive(Debug)]
pub(crate) struct PoolShared {
    state: AtomicU8,
    workers: Vec<WorkerShared>,
    metrics: Arc<RuntimeMetrics>,
    config: RuntimeConfig,
    exited: Mutex<usize>,
    exit_signal: Condvar,
}

impl PoolShared {
    fn new(config: RuntimeConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        let workers = (0..config.workers).map(|_| WorkerShared::new()).collect();
        Self {
            state: AtomicU8::new(ThreadManagerState::Run.as_u8()),
            workers,
            metrics,
            config,
            exited: Mutex::new(0),
            exit_signal: Condvar::new(),
        }
    }

    /// A pool without worker threads, for exercising contexts in isolation.
    #[cfg(test)]
    pub(crate) fn detached(config: RuntimeConfig, metrics: Arc<RuntimeMetrics>) -> Arc<Self> {
        Arc::new(Self::new(config, metrics))
    }

    pub(crate) fn state(&self) -> ThreadManagerState {
        ThreadManagerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub(crate) fn worker(&self, index: usize) -> &WorkerShared {
        &self.workers[index]
    }

    fn route(&self, vid: Vid) -> usize {
        hash::route(vid.raw(), self.workers.len())
    }

    pub(crate) fn schedule(&self, vid: Vid, continuation: Continuation) {
        if self.state() != ThreadManagerState::Run {
            self.metrics.record_dropped();
            debug!(vid = %vid, state = %self.state(), "dropping job scheduled outside RUN");
            return;
        }

        let index = self.route(vid);
        match self.workers[index].queue.push(Job::new(vid, continuation)) {
            Ok(()) => self.metrics.record_schedule(),
            Err(_) => self.metrics.record_dropped(),
        }
    }

    /// Moves RUN to `target`. Fails if the pool is no longer running.
    fn leave_run(&self, target: ThreadManagerState) -> Result<()> {
        self.state
            .compare_exchange(
                ThreadManagerState::Run.as_u8(),
                target.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|current| RuntimeError::InvalidStateTransition {
                from: ThreadManagerState::from_u8(current),
                to: target,
            })
    }

    fn cancel_all(&self) {
        for worker in &self.workers {
            let discarded = worker.queue.cancel();
            self.metrics.record_discarded(discarded);
        }
    }

    fn wake_all(&self) {
        for worker in &self.workers {
            worker.queue.wake();
        }
    }

    /// Records an uncaught failure of worker `index` and tears down the pool.
    pub(crate) fn escalate(&self, index: usize, vid: Vid, error: RuntimeError) {
        error!(worker = index, vid = %vid, error = %error, "uncaught exception in worker");
        self.metrics.record_uncaught();
        self.workers[index].record_exception(vid, error);
        let escalated = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match ThreadManagerState::from_u8(current) {
                    ThreadManagerState::Run | ThreadManagerState::Stop => {
                        Some(ThreadManagerState::Kill.as_u8())
                    }
                    ThreadManagerState::Kill | ThreadManagerState::Dead => None,
                }
            })
            .is_ok();
        if escalated {
            warn!(worker = index, "thread manager escalated to KILL");
        }
        self.cancel_all();
    }

    pub(crate) fn worker_exited(&self, index: usize) {
        let mut exited = self.exited.lock();
        *exited += 1;
        debug!(worker = index, exited = *exited, "worker exited");
        self.exit_signal.notify_all();
    }

    /// Waits until every worker has left its loop or `deadline` passes.
    fn wait_for_exit(&self, deadline: Instant) -> bool {
        let mut exited = self.exited.lock();
        while *exited < self.workers.len() {
            if self.exit_signal.wait_until(&mut exited, deadline).timed_out() {
                return *exited >= self.workers.len();
            }
        }
        true
    }
}

/// Fixed-size pool of worker threads.
pub struct ThreadManager {
    pool: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadManager {
    /// Spawns `config.workers` workers and enters RUN.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_metrics(config, RuntimeMetrics::new())
    }

    pub fn with_workers(workers: usize, config: RuntimeConfig) -> Result<Self> {
        Self::new(config.with_workers(workers))
    }

    pub(crate) fn with_metrics(config: RuntimeConfig, metrics: Arc<RuntimeMetrics>) -> Result<Self> {
        if config.workers == 0 {
            return Err(RuntimeError::config("thread manager needs at least one worker"));
        }
        if config.stack_size == 0 {
            return Err(RuntimeError::config("worker stack size must be non-zero"));
        }

        let pool = Arc::new(PoolShared::new(config, metrics));
        let manager = Self {
            pool: Arc::clone(&pool),
            handles: Mutex::new(Vec::with_capacity(pool.workers.len())),
        };

        for index in 0..pool.workers.len() {
            let worker_pool = Arc::clone(&pool);
            let spawned = thread::Builder::new()
                .name(format!("hilti-worker-{index}"))
                .stack_size(pool.config.stack_size)
                .spawn(move || worker::run(worker_pool, index));

            match spawned {
                Ok(handle) => manager.handles.lock().push(handle),
                Err(err) => {
                    // Dropping `manager` cancels and joins what was spawned so far.
                    return Err(RuntimeError::OutOfMemory(format!(
                        "failed to spawn worker thread {index}: {err}"
                    )));
                }
            }
        }

        info!(workers = pool.workers.len(), "thread manager started");
        Ok(manager)
    }

    pub fn state(&self) -> ThreadManagerState {
        self.pool.state()
    }

    pub fn num_workers(&self) -> usize {
        self.pool.workers.len()
    }

    /// Index of the worker that runs `vid`.
    pub fn worker_for(&self, vid: Vid) -> usize {
        self.pool.route(vid)
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.pool.metrics)
    }

    /// Queues `continuation` for `vid` on the worker `vid` hashes to.
    ///
    /// Outside of RUN the job is dropped without an error.
    pub fn schedule(&self, vid: Vid, continuation: Continuation) {
        self.pool.schedule(vid, continuation);
    }

    pub fn schedule_fn<F>(&self, vid: Vid, func: F)
    where
        F: FnOnce(&mut ExecutionContext) -> Result<()> + Send + 'static,
    {
        self.schedule(vid, Continuation::new(func));
    }

    /// Requests STOP (drain, then exit) or KILL (discard queued work) and
    /// blocks until the pool is DEAD.
    pub fn set_state(&self, target: ThreadManagerState) -> Result<()> {
        if !ThreadManagerState::Run.can_transition_to(target) {
            return Err(RuntimeError::InvalidStateTransition {
                from: self.state(),
                to: target,
            });
        }
        self.pool.leave_run(target)?;
        info!(state = %target, "thread manager leaving RUN");

        if target == ThreadManagerState::Kill {
            self.pool.cancel_all();
        } else {
            self.pool.wake_all();
        }
        self.join()
    }

    /// Joins every worker and moves the pool to DEAD.
    ///
    /// A stopping pool gets the configured grace period to drain before its
    /// workers are cancelled.
    pub fn join(&self) -> Result<()> {
        let state = self.state();
        match state {
            ThreadManagerState::Run => {
                return Err(RuntimeError::InvalidStateTransition {
                    from: state,
                    to: ThreadManagerState::Dead,
                });
            }
            ThreadManagerState::Dead => return Ok(()),
            ThreadManagerState::Stop => {
                let deadline = Instant::now() + self.pool.config.grace_period;
                if !self.pool.wait_for_exit(deadline) {
                    warn!(
                        grace_period = ?self.pool.config.grace_period,
                        "workers did not drain in time, cancelling"
                    );
                    self.pool.cancel_all();
                }
            }
            ThreadManagerState::Kill => {}
        }

        self.join_handles();
        Ok(())
    }

    fn join_handles(&self) {
        let mut handles = self.handles.lock();
        for (index, handle) in handles.drain(..).enumerate() {
            if handle.join().is_err() {
                // Jobs run under catch_unwind, so this only covers the loop itself.
                self.pool.workers[index].record_exception(
                    Vid::MAIN,
                    RuntimeError::raised("worker thread panicked"),
                );
            }
        }
        self.pool
            .state
            .store(ThreadManagerState::Dead.as_u8(), Ordering::SeqCst);
        debug!("thread manager is DEAD");
    }

    /// Failure recorded by worker `index`, if any.
    pub fn worker_exception(&self, index: usize) -> Option<WorkerException> {
        self.pool
            .workers
            .get(index)
            .and_then(|worker| worker.exception.lock().clone())
    }

    /// Reports unhandled worker failures as one aggregate error.
    ///
    /// Only valid once the pool is DEAD. Reported failures are marked handled,
    /// so a second call returns `Ok`.
    pub fn check_exceptions(&self) -> Result<()> {
        let state = self.state();
        if state != ThreadManagerState::Dead {
            return Err(RuntimeError::InvalidStateTransition {
                from: state,
                to: ThreadManagerState::Dead,
            });
        }

        let mut first: Option<(usize, Vid, String)> = None;
        let mut failed_workers = 0;
        for (index, worker) in self.pool.workers.iter().enumerate() {
            let mut slot = worker.exception.lock();
            if let Some(exception) = slot.as_mut() {
                if exception.status == ExceptionStatus::Unhandled {
                    exception.status = ExceptionStatus::Handled;
                    failed_workers += 1;
                    if first.is_none() {
                        first = Some((index, exception.vid, exception.error.to_string()));
                    }
                }
            }
        }

        match first {
            Some((worker, vid, message)) => Err(RuntimeError::UncaughtWorkerException {
                worker,
                vid,
                message,
                failed_workers,
            }),
            None => Ok(()),
        }
    }

    /// Releases the manager. Only valid once the pool is DEAD; a manager in
    /// any other state is killed and joined on the way out and the misuse is
    /// reported.
    pub fn destroy(self) -> Result<()> {
        let state = self.state();
        if state != ThreadManagerState::Dead {
            return Err(RuntimeError::InvalidStateTransition {
                from: state,
                to: ThreadManagerState::Dead,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadManager")
            .field("state", &self.state())
            .field("workers", &self.num_workers())
            .finish()
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        if self.state() == ThreadManagerState::Dead {
            return;
        }
        let _ = self.pool.leave_run(ThreadManagerState::Kill);
        self.pool.cancel_all();
        self.join_handles();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_run_may_be_left() {
        for from in ThreadManagerState::ALL {
            for to in ThreadManagerState::ALL {
                let expected = from == ThreadManagerState::Run
                    && matches!(to, ThreadManagerState::Stop | ThreadManagerState::Kill);
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn state_roundtrips_through_atomic_encoding() {
        for state in ThreadManagerState::ALL {
            assert_eq!(ThreadManagerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = ThreadManager::with_workers(0, RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigError(_)));
    }
}
