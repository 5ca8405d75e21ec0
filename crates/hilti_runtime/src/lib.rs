//! Execution runtime core for compiled HILTI programs.
//!
//! - [`threads`]: fixed worker pool multiplexing virtual threads.
//! - [`timer`]: logical-clock timer manager for deferred callbacks.
//! - [`command`]: single-consumer queue serializing side effects.
//! - [`Runtime`]: the handle tying them together.

pub mod command;
pub mod config;
pub mod error;
pub mod hash;
pub mod runtime;
pub mod threads;
pub mod timer;
pub mod version;

pub use command::{Command, CommandQueue, SinkId};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use runtime::Runtime;
pub use threads::{
    Continuation, ExecutionContext, RuntimeMetrics, RuntimeMetricsSnapshot, ThreadManager,
    ThreadManagerState, Vid,
};
pub use timer::{EntryCookie, ExpiryHooks, Time, Timer, TimerKind, TimerManager};
