use std::time::Duration;

use async_trait::async_trait;
use lifecycle::{RunContext, Runner, RunnerError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

const METRIC_RESYNCS: &str = "controller_resyncs_total";

/// Control loop for one resource kind. Reconciliation itself lives outside
/// this process's lifecycle layer; the loop owns the resync cadence and
/// stops when its lifetime is cancelled.
pub struct ResyncLoop {
    kind: &'static str,
    period: Duration,
}

impl ResyncLoop {
    pub fn new(kind: &'static str, period: Duration) -> Self {
        Self { kind, period }
    }
}

#[async_trait]
impl Runner for ResyncLoop {
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunnerError> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            kind = self.kind,
            period_secs = self.period.as_secs(),
            "control loop started"
        );
        ctx.ready();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(kind = self.kind, "resyncing");
                    metrics::counter!(METRIC_RESYNCS, "kind" => self.kind).increment(1);
                }
            }
        }

        info!(kind = self.kind, "control loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use health::ProbeState;
    use lifecycle::{
        DelayPolicy, RunnerRegistry, ShutdownRequest, Supervisor, SupervisorOptions,
    };
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn loops_stop_after_shutdown_delay() {
        let probe = ProbeState::new();
        let supervisor = Supervisor::new(
            SupervisorOptions {
                name: "mt-broker-controller".to_string(),
                shutdown_delay: DelayPolicy::from_secs(20),
                ..SupervisorOptions::default()
            },
            probe.clone(),
        );
        let registry = RunnerRegistry::new()
            .with_runner("broker", ResyncLoop::new("broker", Duration::from_secs(5)))
            .unwrap()
            .with_runner("trigger", ResyncLoop::new("trigger", Duration::from_secs(5)))
            .unwrap();
        let (tx, rx) = mpsc::channel(1);

        let start = tokio::time::Instant::now();
        let run = tokio::spawn(supervisor.run(registry, rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(probe.is_ready());

        tx.send(ShutdownRequest::new("SIGTERM")).await.unwrap();
        run.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(32));
        assert!(!probe.is_ready());
    }
}
