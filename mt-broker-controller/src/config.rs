use std::time::Duration;

use common_sharedmain::ProcessConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub process: ProcessConfig,

    // Full resync of every watched resource, in seconds.
    #[envconfig(from = "RESYNC_PERIOD_SECS", default = "600")]
    pub resync_period_secs: u64,
}

impl Config {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs.max(1))
    }
}
