use std::sync::Arc;

use anyhow::Context;
use common_sharedmain::ProcessSupervisor;
use envconfig::Envconfig;

mod adapter;
mod config;

use adapter::{Dispatch, PingAdapter};
use config::Config;

const COMPONENT: &str = "pingsource-mt-adapter";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    let tick = config.schedule_tick();

    ProcessSupervisor::new(COMPONENT, config.process)
        .with_runner("adapter", move |observability| {
            // Schedules come from the PingSource resources, which this
            // process does not watch yet, so nothing is ever due.
            let dispatch: Dispatch = Arc::new(|| Ok(0));
            Ok(Box::new(PingAdapter::new(
                tick,
                dispatch,
                observability.status().clone(),
            )))
        })
        .run()
        .await
}
