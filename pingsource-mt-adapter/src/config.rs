use std::time::Duration;

use common_sharedmain::ProcessConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub process: ProcessConfig,

    // How often due ping schedules are evaluated, in seconds.
    #[envconfig(from = "PING_SCHEDULE_TICK_SECS", default = "60")]
    pub schedule_tick_secs: u64,
}

impl Config {
    pub fn schedule_tick(&self) -> Duration {
        Duration::from_secs(self.schedule_tick_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.schedule_tick(), Duration::from_secs(60));
        assert_eq!(config.process.shutdown_delay_secs, 0);
    }
}
