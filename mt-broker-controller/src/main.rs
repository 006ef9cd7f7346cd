use anyhow::Context;
use common_sharedmain::ProcessSupervisor;
use envconfig::Envconfig;

mod config;
mod resync;

use config::Config;
use resync::ResyncLoop;

const COMPONENT: &str = "mt-broker-controller";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    let period = config.resync_period();

    ProcessSupervisor::new(COMPONENT, config.process)
        .with_runner("broker", move |_| Ok(Box::new(ResyncLoop::new("broker", period))))
        .with_runner("trigger", move |_| Ok(Box::new(ResyncLoop::new("trigger", period))))
        .run()
        .await
}
