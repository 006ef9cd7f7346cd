//! Process lifecycle for control processes: cancellable lifetimes, delayed
//! cancellation on termination signals, and supervision of long-running
//! runners with fail-fast shutdown and a bounded drain.

mod error;
mod lifetime;
mod metrics;
mod readiness;
mod runner;
mod shutdown;
mod signals;
mod supervisor;

pub use error::LifecycleError;
pub use lifetime::{CancelCause, Lifetime};
pub use runner::{RunContext, Runner, RunnerError};
pub use shutdown::{DelayPolicy, DelayingShutdownCoordinator, ShutdownRequest, ShutdownState};
pub use signals::trap_termination_signals;
pub use supervisor::{RunnerRegistry, Supervisor, SupervisorOptions, DEFAULT_DRAIN_DEADLINE};
