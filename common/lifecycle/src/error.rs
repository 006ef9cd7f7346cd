//! Lifecycle error types returned by the supervisor.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`Supervisor::run`](crate::Supervisor::run) and registry setup.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A runner returned an error.
    #[error("runner '{runner}' failed: {reason}")]
    RunnerFailed { runner: String, reason: String },

    /// A runner's task panicked.
    #[error("runner '{runner}' panicked")]
    RunnerPanicked { runner: String },

    /// Runners were still running when the drain deadline elapsed.
    #[error("drain deadline of {elapsed:?} reached, runners still running: {remaining:?}")]
    DrainTimeout {
        elapsed: Duration,
        remaining: Vec<String>,
    },

    #[error("runner '{0}' is already registered")]
    DuplicateRunner(String),

    /// SIGINT/SIGTERM handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}
