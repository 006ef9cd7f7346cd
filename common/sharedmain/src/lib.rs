//! Shared entry point for control processes.
//!
//! [`ProcessSupervisor`] wires the probe server, the observability config
//! pipeline, signal handling and the runner supervisor together, so a binary
//! only has to load its own settings and name its runners.

mod config;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use common_observability::aspects::{
    LoggingAspect, LoggingSettings, MetricsAspect, MetricsSettings, ProfilingAspect,
    ProfilingSettings, StatusAspect, StatusReporter, StatusSettings, TracingAspect,
    TracingSettings,
};
use common_observability::{load_mount, AspectHandle, ConfigPipeline, ConfigWatcher};
use health::{ProbeError, ProbeServer, ProbeState};
use lifecycle::{
    trap_termination_signals, CancelCause, LifecycleError, Runner, RunnerRegistry,
    ShutdownRequest, Supervisor, SupervisorOptions,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub use config::{LogFormat, ProcessConfig};
pub use logging::{setup_tracing, TracingReloaders};

const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// What runner constructors get to see of the process: its name, the status
/// reporter and read access to every aspect's current settings.
#[derive(Clone)]
pub struct Observability {
    component: String,
    status: StatusReporter,
    logging: AspectHandle<LoggingSettings>,
    metrics: AspectHandle<MetricsSettings>,
    tracing: AspectHandle<TracingSettings>,
    profiling: AspectHandle<ProfilingSettings>,
    status_settings: AspectHandle<StatusSettings>,
}

impl Observability {
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn logging(&self) -> &AspectHandle<LoggingSettings> {
        &self.logging
    }

    pub fn metrics(&self) -> &AspectHandle<MetricsSettings> {
        &self.metrics
    }

    pub fn tracing(&self) -> &AspectHandle<TracingSettings> {
        &self.tracing
    }

    pub fn profiling(&self) -> &AspectHandle<ProfilingSettings> {
        &self.profiling
    }

    pub fn status_settings(&self) -> &AspectHandle<StatusSettings> {
        &self.status_settings
    }
}

/// Process-wide handles that only exist once per process.
pub struct ProcessGlobals {
    pub reloaders: TracingReloaders,
    pub recorder: PrometheusHandle,
    pub requests: mpsc::Receiver<ShutdownRequest>,
}

type RunnerConstructor =
    Box<dyn FnOnce(&Observability) -> anyhow::Result<Box<dyn Runner>> + Send + 'static>;

pub struct ProcessSupervisor {
    component: String,
    config: ProcessConfig,
    constructors: Vec<(String, RunnerConstructor)>,
}

impl ProcessSupervisor {
    /// `component` is used unless `COMPONENT_NAME` overrides it.
    pub fn new(component: &str, config: ProcessConfig) -> Self {
        Self {
            component: config.component_or(component).to_string(),
            config,
            constructors: Vec::new(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Register a runner. The constructor runs after observability is set
    /// up, right before the runners start.
    pub fn with_runner<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: FnOnce(&Observability) -> anyhow::Result<Box<dyn Runner>> + Send + 'static,
    {
        self.constructors.push((name.to_string(), Box::new(constructor)));
        self
    }

    /// Run the process until every runner has exited. Returns an error for
    /// any fatal startup problem, runner failure, drain timeout or probe
    /// server failure.
    ///
    /// Installs the global tracing subscriber, metrics recorder and signal
    /// handlers, so it can only run once per process.
    pub async fn run(self) -> anyhow::Result<()> {
        let reloaders = setup_tracing(self.config.log_format)?;
        info!(component = %self.component, "starting");

        let recorder = PrometheusBuilder::new()
            .set_buckets(BUCKETS)
            .context("invalid histogram buckets")?
            .add_global_label("component", self.component.clone())
            .install_recorder()
            .context("failed to install metrics recorder")?;

        // Trapped before anything slow happens, so a termination request
        // during startup still goes through the shutdown delay.
        let requests = trap_termination_signals().context("failed to install signal handlers")?;

        self.run_with(ProcessGlobals {
            reloaders,
            recorder,
            requests,
        })
        .await
    }

    /// [`ProcessSupervisor::run`] with the process-global pieces provided by
    /// the caller.
    pub async fn run_with(self, globals: ProcessGlobals) -> anyhow::Result<()> {
        let ProcessSupervisor {
            component,
            config,
            constructors,
        } = self;
        let ProcessGlobals {
            reloaders,
            recorder,
            requests,
        } = globals;

        // Probes come first so the platform can see the process while the
        // rest starts up.
        let probe = ProbeState::new();
        let bound = ProbeServer::new(config.probes_port()?, probe.clone())
            .with_strict_readiness(config.probes_strict_readiness)
            .bind()
            .await
            .context("failed to start probe server")?;

        let supervisor = Supervisor::new(
            SupervisorOptions {
                name: component.clone(),
                shutdown_delay: config.shutdown_delay(),
                drain_deadline: config.drain_deadline(),
            },
            probe,
        );
        let root = supervisor.root().clone();

        let probe_task = {
            let root = root.clone();
            tokio::spawn(async move {
                let result = bound.serve(root.cancelled_owned()).await;
                if let Err(e) = &result {
                    error!(error = %e, "probe server failed");
                    root.cancel(CancelCause::ProbeServerFailed);
                }
                result
            })
        };

        let status = StatusReporter::new(&component);
        let mut pipeline = ConfigPipeline::new();
        let logging = pipeline.register(
            LoggingAspect::new(&component, reloaders.filter)
                .with_initial_directive(reloaders.initial_directive),
        );
        let metrics = pipeline.register(MetricsAspect::new(recorder, config.metrics_port));
        let tracing = pipeline.register(TracingAspect::new(&component, reloaders.tracer));
        let profiling = pipeline.register(ProfilingAspect::new(config.profiling_port));
        let status_settings = pipeline.register(StatusAspect::new(status.clone()));
        let pipeline = Arc::new(pipeline);

        let mount = &config.config_mount_path;
        let snapshots = load_mount(mount)
            .with_context(|| format!("failed to read config mount {}", mount.display()))?;
        let report = pipeline.apply_all(snapshots).await;
        let rejected = report.iter().filter(|(_, result)| result.is_err()).count();
        info!(
            aspects = report.len(),
            rejected, "observability configuration applied"
        );

        // Dropping the watcher stops it, so it lives until run returns.
        let _watcher = if config.config_watcher_enabled && mount.is_dir() {
            let (watcher, updates) = ConfigWatcher::new(mount);
            match watcher.run() {
                Ok(watcher) => {
                    let pipeline = pipeline.clone();
                    let lifetime = root.clone();
                    tokio::spawn(async move { pipeline.watch(updates, lifetime).await });
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "config watcher unavailable, configuration is static");
                    None
                }
            }
        } else {
            None
        };

        let observability = Observability {
            component: component.clone(),
            status,
            logging,
            metrics,
            tracing,
            profiling,
            status_settings,
        };
        let mut registry = RunnerRegistry::new();
        for (name, constructor) in constructors {
            let runner = constructor(&observability)
                .with_context(|| format!("failed to construct runner '{name}'"))?;
            registry.register_boxed(name, runner)?;
        }

        let outcome = supervisor.run(registry, requests).await;

        // The supervisor cancels the root on exit, which stops the probe
        // server gracefully.
        let probe_outcome = probe_task.await.context("probe server task failed")?;

        if let Err(e) =
            tokio::task::spawn_blocking(opentelemetry::global::shutdown_tracer_provider).await
        {
            warn!(error = %e, "failed to flush tracer provider");
        }

        exit_status(outcome, probe_outcome)?;
        info!(component = %component, "shutdown complete");
        Ok(())
    }
}

/// Runner failures win over probe failures; either makes the exit non-zero.
fn exit_status(
    outcome: Result<(), LifecycleError>,
    probe_outcome: Result<(), ProbeError>,
) -> anyhow::Result<()> {
    outcome.context("runner execution failed")?;
    probe_outcome.context("probe server stopped serving")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn serve_failure_fails_a_clean_run() {
        let err = exit_status(Ok(()), Err(ProbeError::Serve(std::io::Error::other("reset"))))
            .unwrap_err();
        assert_eq!(err.to_string(), "probe server stopped serving");
    }

    #[test]
    fn runner_failure_is_reported_first() {
        let err = exit_status(
            Err(LifecycleError::DrainTimeout {
                elapsed: Duration::from_secs(30),
                remaining: vec!["broker".to_string()],
            }),
            Err(ProbeError::Serve(std::io::Error::other("reset"))),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "runner execution failed");
    }

    #[test]
    fn clean_run_exits_ok() {
        exit_status(Ok(()), Ok(())).unwrap();
    }
}
