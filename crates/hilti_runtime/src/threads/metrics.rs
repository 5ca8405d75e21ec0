use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the thread manager, its workers and the command queue.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    scheduled: AtomicU64,
    executed: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    yields: AtomicU64,
    uncaught: AtomicU64,
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_schedule(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    /// A job offered while the pool was no longer running.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: usize) {
        if count != 0 {
            self.discarded.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn record_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncaught(&self) {
        self.uncaught.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, ok: bool) {
        if ok {
            self.commands_executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            jobs_scheduled: self.scheduled.load(Ordering::Relaxed),
            jobs_executed: self.executed.load(Ordering::Relaxed),
            jobs_dropped: self.dropped.load(Ordering::Relaxed),
            jobs_discarded: self.discarded.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            uncaught_exceptions: self.uncaught.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMetricsSnapshot {
    pub jobs_scheduled: u64,
    pub jobs_executed: u64,
    pub jobs_dropped: u64,
    pub jobs_discarded: u64,
    pub yields: u64,
    pub uncaught_exceptions: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
}
