use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::context::{Continuation, Vid};

/// One scheduled (vid, continuation) pair. Ownership moves from the producer
/// into the queue and from the queue to the owning worker.
#[derive(Debug)]
pub struct Job {
    vid: Vid,
    continuation: Continuation,
}

impl Job {
    pub fn new(vid: Vid, continuation: Continuation) -> Self {
        Self { vid, continuation }
    }

    pub fn vid(&self) -> Vid {
        self.vid
    }

    pub(crate) fn into_parts(self) -> (Vid, Continuation) {
        (self.vid, self.continuation)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    cancelled: bool,
}

/// Outcome of a worker's attempt to fetch work.
#[derive(Debug)]
pub(crate) enum Fetch {
    Job(Job),
    Empty,
    Cancelled,
}

/// FIFO of pending jobs for a single worker.
///
/// Any thread may push; only the owning worker pops. The lock guards the
/// deque itself and is never held while a job runs.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `job`; returns it back if the queue has been cancelled.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(job);
        }
        let was_empty = state.jobs.is_empty();
        state.jobs.push_back(job);
        drop(state);
        if was_empty {
            self.available.notify_one();
        }
        Ok(())
    }

    pub fn try_pop(&self) -> Fetch {
        let mut state = self.state.lock();
        if state.cancelled {
            return Fetch::Cancelled;
        }
        match state.jobs.pop_front() {
            Some(job) => Fetch::Job(job),
            None => Fetch::Empty,
        }
    }

    /// Like [`JobQueue::try_pop`], but parks for at most `timeout` while the
    /// queue is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Fetch {
        let mut state = self.state.lock();
        if !state.cancelled && state.jobs.is_empty() {
            let _ = self.available.wait_for(&mut state, timeout);
        }
        if state.cancelled {
            return Fetch::Cancelled;
        }
        match state.jobs.pop_front() {
            Some(job) => Fetch::Job(job),
            None => Fetch::Empty,
        }
    }

    /// Marks the queue cancelled and drops everything still pending.
    /// Returns the number of jobs discarded.
    pub fn cancel(&self) -> usize {
        let mut state = self.state.lock();
        state.cancelled = true;
        let discarded = state.jobs.len();
        state.jobs.clear();
        drop(state);
        self.available.notify_all();
        discarded
    }

    /// Wakes a parked consumer without changing the queue.
    pub fn wake(&self) {
        let _guard = self.state.lock();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}
