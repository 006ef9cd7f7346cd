use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_observability::aspects::{ReportOutcome, StatusReporter};
use lifecycle::{RunContext, Runner, RunnerError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

const METRIC_TICKS: &str = "pingsource_schedule_ticks_total";
const METRIC_DISPATCHED: &str = "pingsource_events_dispatched_total";

/// Sends the pings that are due at a tick and returns how many went out.
pub type Dispatch = Arc<dyn Fn() -> anyhow::Result<usize> + Send + Sync>;

/// Evaluates ping schedules once per tick until cancelled. Dispatch errors
/// are reported and the loop carries on with the next tick.
pub struct PingAdapter {
    tick: Duration,
    dispatch: Dispatch,
    status: StatusReporter,
}

impl PingAdapter {
    pub fn new(tick: Duration, dispatch: Dispatch, status: StatusReporter) -> Self {
        Self {
            tick,
            dispatch,
            status,
        }
    }

    fn on_tick(&self) {
        metrics::counter!(METRIC_TICKS).increment(1);
        match (self.dispatch)() {
            Ok(0) => {}
            Ok(sent) => {
                metrics::counter!(METRIC_DISPATCHED).increment(sent as u64);
                self.status
                    .report(ReportOutcome::Delivered, "ping", &format!("{sent} events"));
            }
            Err(e) => {
                warn!(error = %e, "ping dispatch failed");
                self.status
                    .report(ReportOutcome::Failed, "ping", &e.to_string());
            }
        }
    }
}

#[async_trait]
impl Runner for PingAdapter {
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunnerError> {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_secs = self.tick.as_secs(), "ping adapter started");
        ctx.ready();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => self.on_tick(),
            }
        }

        info!("ping adapter stopped");
        Ok(())
    }
}
