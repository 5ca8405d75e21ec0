//! Explicitly constructed runtime handle.
//!
//! Bundles the worker pool, the command queue and the shared metrics. Code
//! that needs the runtime receives this handle (or pieces of it); nothing is
//! reachable through process-wide globals.

use std::sync::Arc;

use tracing::info;

use crate::command::CommandQueue;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::threads::{
    Continuation, ExecutionContext, RuntimeMetrics, ThreadManager, ThreadManagerState, Vid,
};

#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    threads: Option<ThreadManager>,
    commands: CommandQueue,
    metrics: Arc<RuntimeMetrics>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let metrics = RuntimeMetrics::new();

        let (threads, commands) = if config.threaded {
            let threads = ThreadManager::with_metrics(config.clone(), Arc::clone(&metrics))?;
            let commands = CommandQueue::threaded(Arc::clone(&metrics))?;
            (Some(threads), commands)
        } else {
            (None, CommandQueue::inline(Arc::clone(&metrics)))
        };

        info!(
            threaded = config.threaded,
            workers = threads.as_ref().map_or(0, ThreadManager::num_workers),
            "runtime initialised"
        );

        Ok(Self {
            config,
            threads,
            commands,
            metrics,
        })
    }

    /// Defaults overlaid with `HILTI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// True while this runtime owns a worker pool.
    pub fn is_multi_threaded(&self) -> bool {
        self.threads.is_some()
    }

    pub fn thread_manager(&self) -> Result<&ThreadManager> {
        self.threads.as_ref().ok_or(RuntimeError::NoThreading)
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn schedule(&self, vid: Vid, continuation: Continuation) -> Result<()> {
        self.thread_manager()?.schedule(vid, continuation);
        Ok(())
    }

    pub fn schedule_fn<F>(&self, vid: Vid, func: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionContext) -> Result<()> + Send + 'static,
    {
        self.schedule(vid, Continuation::new(func))
    }

    /// Stops the pool (draining it when `graceful`, killing it otherwise),
    /// flushes the command queue and reports any uncaught worker exception.
    pub fn shutdown(mut self, graceful: bool) -> Result<()> {
        let outcome = match self.threads.take() {
            Some(threads) => {
                let target = if graceful {
                    ThreadManagerState::Stop
                } else {
                    ThreadManagerState::Kill
                };
                match threads.set_state(target) {
                    Ok(()) => {}
                    // A worker failure already moved the pool to KILL.
                    Err(RuntimeError::InvalidStateTransition { .. }) => threads.join()?,
                    Err(err) => return Err(err),
                }
                let outcome = threads.check_exceptions();
                threads.destroy()?;
                outcome
            }
            None => Ok(()),
        };

        self.commands.shutdown();
        info!(metrics = ?self.metrics.snapshot(), "runtime shut down");
        outcome
    }
}
