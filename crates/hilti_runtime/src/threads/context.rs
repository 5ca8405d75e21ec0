use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};

use super::PoolShared;

/// Identifier of a virtual thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vid(i64);

impl Vid {
    /// The logical entry thread.
    pub const MAIN: Vid = Vid(-1);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_main(self) -> bool {
        self.0 == Self::MAIN.0
    }
}

impl From<i64> for Vid {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            f.write_str("main")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

pub type ContinuationFn = Box<dyn FnOnce(&mut ExecutionContext) -> Result<()> + Send + 'static>;

/// A bound resume point. The runtime only ever invokes it.
pub struct Continuation(ContinuationFn);

impl Continuation {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(&mut ExecutionContext) -> Result<()> + Send + 'static,
    {
        Self(Box::new(func))
    }

    pub(crate) fn invoke(self, ctx: &mut ExecutionContext) -> Result<()> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Continuation(..)")
    }
}

/// Per (worker, vid) state, handed to every continuation the worker runs for
/// that vid.
pub struct ExecutionContext {
    vid: Vid,
    worker: usize,
    runs: u64,
    resume: Option<Continuation>,
    pool: Arc<PoolShared>,
}

impl ExecutionContext {
    pub(crate) fn new(vid: Vid, worker: usize, pool: Arc<PoolShared>) -> Self {
        Self {
            vid,
            worker,
            runs: 0,
            resume: None,
            pool,
        }
    }

    pub fn vid(&self) -> Vid {
        self.vid
    }

    /// Index of the worker this vid is pinned to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Number of jobs this vid has run so far, including the current one.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Suspends the current virtual thread: once the running continuation
    /// returns, `resume` is queued on this same worker.
    ///
    /// Everything the resumed code needs must be captured in `resume`. A
    /// second call within the same job replaces the earlier resume point.
    pub fn yield_with(&mut self, resume: Continuation) {
        self.resume = Some(resume);
    }

    pub fn yield_fn<F>(&mut self, func: F)
    where
        F: FnOnce(&mut ExecutionContext) -> Result<()> + Send + 'static,
    {
        self.yield_with(Continuation::new(func));
    }

    /// Schedules a job for another (or the same) vid through the owning pool.
    ///
    /// Dropped silently once the pool has left the RUN state.
    pub fn schedule(&self, vid: Vid, continuation: Continuation) {
        self.pool.schedule(vid, continuation);
    }

    pub(crate) fn begin_run(&mut self) {
        self.runs += 1;
    }

    pub(crate) fn take_resume(&mut self) -> Option<Continuation> {
        self.resume.take()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("vid", &self.vid)
            .field("worker", &self.worker)
            .field("runs", &self.runs)
            .field("yielded", &self.resume.is_some())
            .finish()
    }
}

/// Largest number of slots a single worker's context table may grow to.
const MAX_CONTEXT_SLOTS: usize = 1 << 24;
const MIN_CONTEXT_SLOTS: usize = 8;

/// Vid-indexed table of execution contexts owned by one worker.
///
/// Only the owning worker touches it, so it needs no locking.
#[derive(Debug, Default)]
pub(crate) struct ContextTable {
    slots: Vec<Option<ExecutionContext>>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns the context for `vid`, creating it with `make` on first use.
    pub fn get_or_create<F>(&mut self, vid: Vid, make: F) -> Result<&mut ExecutionContext>
    where
        F: FnOnce() -> ExecutionContext,
    {
        let index = slot_index(vid);
        if index >= self.slots.len() {
            self.grow(index)?;
        }
        Ok(self.slots[index].get_or_insert_with(make))
    }

    fn grow(&mut self, index: usize) -> Result<()> {
        if index >= MAX_CONTEXT_SLOTS {
            return Err(RuntimeError::OutOfMemory(format!(
                "context table cannot hold slot {index}"
            )));
        }
        let mut new_len = self.slots.len().max(MIN_CONTEXT_SLOTS);
        while new_len <= index {
            new_len *= 2;
        }
        let new_len = new_len.min(MAX_CONTEXT_SLOTS);
        self.slots.try_reserve_exact(new_len - self.slots.len())?;
        self.slots.resize_with(new_len, || None);
        Ok(())
    }
}

/// Interleaves negative and non-negative vids into one dense index space:
/// 0, -1, 1, -2, 2, ... map to 0, 1, 2, 3, 4, ...
fn slot_index(vid: Vid) -> usize {
    let raw = vid.raw();
    let zigzag = ((raw << 1) ^ (raw >> 63)) as u64;
    usize::try_from(zigzag).unwrap_or(usize::MAX)
}
