use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use tracing::{debug, trace};

use crate::error::RuntimeError;

use super::context::{ContextTable, ExecutionContext};
use super::queue::{Fetch, Job};
use super::{PoolShared, ThreadManagerState};

/// Notifies the pool when the worker thread leaves its loop, however it
/// leaves it.
struct ExitGuard<'a> {
    pool: &'a PoolShared,
    index: usize,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.pool.worker_exited(self.index);
    }
}

/// Fetch-execute loop of worker `index`.
pub(crate) fn run(pool: Arc<PoolShared>, index: usize) {
    let _exit = ExitGuard {
        pool: &pool,
        index,
    };
    let queue = &pool.worker(index).queue;
    let idle_sleep = pool.config().idle_sleep;
    let mut contexts = ContextTable::new();
    let backoff = Backoff::new();

    debug!(worker = index, "worker started");

    loop {
        // Observed before fetching so that anything enqueued ahead of a STOP
        // is still seen by the final pop.
        let state = pool.state();
        if state == ThreadManagerState::Kill {
            // Queued jobs are discarded by whoever moved the pool to KILL.
            debug!(worker = index, "worker killed");
            break;
        }
        let stopping = state != ThreadManagerState::Run;

        let fetch = if stopping {
            queue.try_pop()
        } else {
            match queue.try_pop() {
                Fetch::Empty if backoff.is_completed() => queue.pop_timeout(idle_sleep),
                Fetch::Empty => {
                    backoff.snooze();
                    Fetch::Empty
                }
                other => other,
            }
        };

        match fetch {
            Fetch::Job(job) => {
                backoff.reset();
                execute(&pool, index, &mut contexts, job);
            }
            Fetch::Cancelled => {
                debug!(worker = index, "worker cancelled");
                break;
            }
            Fetch::Empty if stopping => {
                // Refuse pushes that raced past the RUN check; they count as dropped.
                let late = queue.cancel();
                pool.metrics().record_discarded(late);
                debug!(worker = index, late, "worker drained its queue");
                break;
            }
            Fetch::Empty => {}
        }
    }

    debug!(worker = index, contexts = contexts.len(), "worker exiting");
}

fn execute(pool: &Arc<PoolShared>, index: usize, contexts: &mut ContextTable, job: Job) {
    let (vid, continuation) = job.into_parts();

    let make = || ExecutionContext::new(vid, index, Arc::clone(pool));
    let ctx = match contexts.get_or_create(vid, make) {
        Ok(ctx) => ctx,
        Err(err) => {
            pool.escalate(index, vid, err);
            return;
        }
    };

    ctx.begin_run();
    trace!(worker = index, vid = %vid, run = ctx.runs(), "executing job");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| continuation.invoke(&mut *ctx)));
    pool.metrics().record_execution();

    let result = outcome
        .unwrap_or_else(|payload| Err(RuntimeError::raised(panic_message(&*payload))));

    match result {
        Ok(()) => {
            if let Some(resume) = ctx.take_resume() {
                pool.metrics().record_yield();
                // Back onto this worker's own queue; a vid never changes workers.
                if pool.worker(index).queue.push(Job::new(vid, resume)).is_err() {
                    pool.metrics().record_discarded(1);
                }
            }
        }
        Err(err) => {
            ctx.take_resume();
            pool.escalate(index, vid, err);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with a non-string payload".to_string()
    }
}
