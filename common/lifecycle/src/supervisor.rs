//! Runner supervision: fail-fast cancellation and a bounded drain.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use health::ProbeState;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::LifecycleError;
use crate::lifetime::{CancelCause, Lifetime};
use crate::metrics;
use crate::readiness::ReadinessTracker;
use crate::runner::{RunContext, Runner, RunnerError};
use crate::shutdown::{deadline_after, DelayPolicy, DelayingShutdownCoordinator, ShutdownRequest};

pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// Used in logs and as the `service_name` metric label.
    pub name: String,
    pub shutdown_delay: DelayPolicy,
    /// How long runners get to exit once the working lifetime is cancelled.
    pub drain_deadline: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            shutdown_delay: DelayPolicy::ZERO,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
        }
    }
}

/// Ordered set of named runners. Names are unique.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<(String, Box<dyn Runner>)>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R: Runner>(
        &mut self,
        name: impl Into<String>,
        runner: R,
    ) -> Result<(), LifecycleError> {
        self.register_boxed(name, Box::new(runner))
    }

    pub fn register_boxed(
        &mut self,
        name: impl Into<String>,
        runner: Box<dyn Runner>,
    ) -> Result<(), LifecycleError> {
        let name = name.into();
        if self.runners.iter().any(|(existing, _)| *existing == name) {
            return Err(LifecycleError::DuplicateRunner(name));
        }
        self.runners.push((name, runner));
        Ok(())
    }

    pub fn with_runner<R: Runner>(
        mut self,
        name: impl Into<String>,
        runner: R,
    ) -> Result<Self, LifecycleError> {
        self.register(name, runner)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.iter().map(|(name, _)| name.as_str())
    }
}

/// How a runner task ended, as seen from inside the task.
enum Exit {
    Returned(Result<(), RunnerError>),
    Panicked,
}

/// Runs every registered runner under a shared working lifetime.
///
/// The working lifetime is cancelled by the shutdown coordinator once its
/// delay elapses, or immediately when a runner fails. After cancellation the
/// runners get [`SupervisorOptions::drain_deadline`] to exit before they are
/// aborted.
pub struct Supervisor {
    options: SupervisorOptions,
    probe: ProbeState,
    root: Lifetime,
    coordinator: Arc<DelayingShutdownCoordinator>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, probe: ProbeState) -> Self {
        let root = Lifetime::new();
        let coordinator = Arc::new(DelayingShutdownCoordinator::new(
            &options.name,
            options.shutdown_delay,
            &root,
        ));
        Self {
            options,
            probe,
            root,
            coordinator,
        }
    }

    /// Cancelling the root bypasses the shutdown delay.
    pub fn root(&self) -> &Lifetime {
        &self.root
    }

    /// The lifetime runners are derived from.
    pub fn work(&self) -> Lifetime {
        self.coordinator.lifetime()
    }

    /// Run every runner until they have all exited. Returns the first failure,
    /// if any.
    pub async fn run(
        self,
        registry: RunnerRegistry,
        requests: mpsc::Receiver<ShutdownRequest>,
    ) -> Result<(), LifecycleError> {
        let Supervisor {
            options,
            probe,
            root,
            coordinator,
        } = self;
        let service = options.name.as_str();
        let work = coordinator.lifetime();
        let tracker = Arc::new(ReadinessTracker::new(service, probe, registry.len()));

        let coordinator_task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(requests).await })
        };
        let stopping_task = {
            let tracker = tracker.clone();
            let requested = coordinator.shutdown_requested();
            let finished = root.cancelled_owned();
            tokio::spawn(async move {
                tokio::select! {
                    _ = requested => tracker.stopping(),
                    _ = finished => {}
                }
            })
        };

        if registry.is_empty() {
            info!(service, "Lifecycle: no runners registered");
        }

        let mut running = BTreeSet::new();
        let mut set = JoinSet::new();
        for (name, runner) in registry.runners {
            let lifetime = work.child();
            let ctx = RunContext::new(&name, lifetime, tracker.clone());
            running.insert(name.clone());
            info!(service, runner = %name, "Lifecycle: starting runner");
            set.spawn(async move {
                let exit = match AssertUnwindSafe(runner.run(ctx)).catch_unwind().await {
                    Ok(result) => Exit::Returned(result),
                    Err(_) => Exit::Panicked,
                };
                (name, exit)
            });
        }

        let mut first_failure: Option<LifecycleError> = None;
        let mut drain_deadline: Option<Instant> = None;

        while !set.is_empty() {
            tokio::select! {
                biased;

                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let (name, exit) = match joined {
                        Ok(joined) => joined,
                        Err(e) => {
                            error!(service, error = %e, "Lifecycle: runner task failed to join");
                            continue;
                        }
                    };
                    running.remove(&name);

                    let failure = match exit {
                        Exit::Returned(Ok(())) => {
                            let result = if work.is_cancelled() {
                                "cancelled"
                            } else {
                                "completed"
                            };
                            metrics::emit_runner_exit(service, &name, result);
                            info!(service, runner = %name, result, "Lifecycle: runner exited");
                            None
                        }
                        Exit::Returned(Err(e)) => {
                            metrics::emit_runner_exit(service, &name, "failed");
                            error!(service, runner = %name, error = %e, "Lifecycle: runner failed");
                            Some(LifecycleError::RunnerFailed {
                                runner: name.clone(),
                                reason: e.to_string(),
                            })
                        }
                        Exit::Panicked => {
                            metrics::emit_runner_exit(service, &name, "panicked");
                            error!(service, runner = %name, "Lifecycle: runner panicked");
                            Some(LifecycleError::RunnerPanicked { runner: name.clone() })
                        }
                    };

                    if let Some(failure) = failure {
                        work.cancel(CancelCause::RunnerFailed { runner: name });
                        tracker.stopping();
                        first_failure.get_or_insert(failure);
                    }
                }

                _ = work.cancelled(), if drain_deadline.is_none() => {
                    let cause = work
                        .cause()
                        .map_or_else(|| "unknown".to_string(), |cause| cause.to_string());
                    metrics::emit_shutdown_initiated(service, &cause);
                    info!(
                        service,
                        %cause,
                        drain_deadline_secs = options.drain_deadline.as_secs_f64(),
                        "Lifecycle: working lifetime cancelled, draining runners"
                    );
                    tracker.stopping();
                    drain_deadline = Some(deadline_after(Instant::now(), options.drain_deadline));
                }

                _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() =>
                {
                    let remaining: Vec<String> = running.iter().cloned().collect();
                    for name in &remaining {
                        metrics::emit_runner_exit(service, name, "aborted");
                    }
                    warn!(
                        service,
                        ?remaining,
                        "Lifecycle: drain deadline reached, aborting remaining runners"
                    );
                    set.abort_all();
                    first_failure.get_or_insert(LifecycleError::DrainTimeout {
                        elapsed: options.drain_deadline,
                        remaining,
                    });
                    break;
                }
            }
        }

        root.cancel(CancelCause::Requested {
            reason: "supervisor exited".to_string(),
        });
        stopping_task.abort();
        coordinator_task.abort();

        metrics::emit_shutdown_completed(service, first_failure.is_none());
        match first_failure {
            Some(e) => Err(e),
            None => {
                info!(service, "Lifecycle: all runners exited");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_runner_rejected() {
        let mut registry = RunnerRegistry::new();
        registry
            .register("broker", |_ctx: RunContext| async { Ok::<_, RunnerError>(()) })
            .unwrap();
        let err = registry
            .register("broker", |_ctx: RunContext| async { Ok::<_, RunnerError>(()) })
            .unwrap_err();

        assert!(matches!(err, LifecycleError::DuplicateRunner(name) if name == "broker"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_keep_registration_order() {
        let registry = RunnerRegistry::new()
            .with_runner("trigger", |_ctx: RunContext| async { Ok::<_, RunnerError>(()) })
            .unwrap()
            .with_runner("broker", |_ctx: RunContext| async { Ok::<_, RunnerError>(()) })
            .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["trigger", "broker"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_runners_returns_ready_and_ok() {
        let probe = ProbeState::new();
        let supervisor = Supervisor::new(SupervisorOptions::default(), probe.clone());
        let (_tx, rx) = mpsc::channel(1);

        supervisor.run(RunnerRegistry::new(), rx).await.unwrap();
        assert!(probe.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_runner_completion_is_not_fatal() {
        let supervisor = Supervisor::new(SupervisorOptions::default(), ProbeState::new());
        let work = supervisor.work();
        let (tx, rx) = mpsc::channel(1);

        let registry = RunnerRegistry::new()
            .with_runner("migrate", |ctx: RunContext| async move {
                ctx.ready();
                Ok::<_, RunnerError>(())
            })
            .unwrap()
            .with_runner("loop", |ctx: RunContext| async move {
                ctx.ready();
                ctx.cancelled().await;
                Ok::<_, RunnerError>(())
            })
            .unwrap();

        let handle = tokio::spawn(supervisor.run(registry, rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!work.is_cancelled());

        tx.send(ShutdownRequest::new("SIGTERM")).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
