use thiserror::Error;

use crate::threads::{ThreadManagerState, Vid};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the runtime core.
///
/// Every variant except [`RuntimeError::Raised`] belongs to the fixed set the
/// runtime itself produces; `Raised` carries failures reported by user
/// continuations and is never interpreted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("timer is not scheduled")]
    NotScheduled,
    #[error("timer is already scheduled")]
    AlreadyScheduled,
    #[error("threading is not available in this runtime")]
    NoThreading,
    #[error(
        "uncaught exception in worker {worker} (vid {vid}): {message} ({failed_workers} worker(s) failed)"
    )]
    UncaughtWorkerException {
        worker: usize,
        vid: Vid,
        message: String,
        failed_workers: usize,
    },
    #[error("invalid thread manager state transition from {from} to {to}")]
    InvalidStateTransition {
        from: ThreadManagerState,
        to: ThreadManagerState,
    },
    #[error("invalid runtime configuration: {0}")]
    ConfigError(String),
    #[error("timer has no timer manager")]
    NoTimerManager,
    #[error("{0}")]
    Raised(String),
}

impl RuntimeError {
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

impl From<std::collections::TryReserveError> for RuntimeError {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let err = RuntimeError::InvalidStateTransition {
            from: ThreadManagerState::Dead,
            to: ThreadManagerState::Run,
        };
        assert_eq!(
            err.to_string(),
            "invalid thread manager state transition from DEAD to RUN"
        );
    }

    #[test]
    fn uncaught_exception_mentions_origin() {
        let err = RuntimeError::UncaughtWorkerException {
            worker: 1,
            vid: Vid::new(5),
            message: "boom".into(),
            failed_workers: 2,
        };
        let text = err.to_string();
        assert!(text.contains("worker 1"));
        assert!(text.contains("vid 5"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn reserve_failure_maps_to_out_of_memory() {
        let mut buf: Vec<u64> = Vec::new();
        let err = buf.try_reserve(usize::MAX).unwrap_err();
        assert!(matches!(RuntimeError::from(err), RuntimeError::OutOfMemory(_)));
    }
}
