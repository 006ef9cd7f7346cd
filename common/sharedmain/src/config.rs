use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use lifecycle::DelayPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}', expected text or json")),
        }
    }
}

/// Process-level settings shared by every binary.
#[derive(Envconfig, Clone, Debug)]
pub struct ProcessConfig {
    // Empty means the default probe port.
    #[envconfig(from = "PROBES_PORT", default = "")]
    pub probes_port: String,

    #[envconfig(from = "PROBES_STRICT_READINESS", default = "false")]
    pub probes_strict_readiness: bool,

    #[envconfig(from = "METRICS_PORT", default = "9090")]
    pub metrics_port: u16,

    #[envconfig(from = "PROFILING_PORT", default = "8008")]
    pub profiling_port: u16,

    #[envconfig(from = "SHUTDOWN_DELAY_SECS", default = "0")]
    pub shutdown_delay_secs: u64,

    #[envconfig(from = "DRAIN_DEADLINE_SECS", default = "30")]
    pub drain_deadline_secs: u64,

    #[envconfig(from = "CONFIG_MOUNT_PATH", default = "/etc/config")]
    pub config_mount_path: PathBuf,

    #[envconfig(from = "CONFIG_WATCHER_ENABLED", default = "true")]
    pub config_watcher_enabled: bool,

    #[envconfig(from = "COMPONENT_NAME")]
    pub component_name: Option<String>,

    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,
}

impl ProcessConfig {
    pub fn probes_port(&self) -> anyhow::Result<u16> {
        let raw = self.probes_port.trim();
        if raw.is_empty() {
            return Ok(health::DEFAULT_PROBES_PORT);
        }
        raw.parse()
            .with_context(|| format!("invalid PROBES_PORT '{raw}'"))
    }

    pub fn shutdown_delay(&self) -> DelayPolicy {
        DelayPolicy::from_secs(self.shutdown_delay_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    /// `COMPONENT_NAME` when set, otherwise the binary's own name.
    pub fn component_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.component_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ProcessConfig {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProcessConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn defaults() {
        let config = config(&[]);
        assert_eq!(config.probes_port().unwrap(), 8081);
        assert!(!config.probes_strict_readiness);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.profiling_port, 8008);
        assert_eq!(config.shutdown_delay(), DelayPolicy::ZERO);
        assert_eq!(config.drain_deadline(), Duration::from_secs(30));
        assert_eq!(config.config_mount_path, PathBuf::from("/etc/config"));
        assert!(config.config_watcher_enabled);
        assert_eq!(config.component_or("controller"), "controller");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("PROBES_PORT", "9000"),
            ("SHUTDOWN_DELAY_SECS", "15"),
            ("COMPONENT_NAME", "custom"),
            ("LOG_FORMAT", "JSON"),
        ]);
        assert_eq!(config.probes_port().unwrap(), 9000);
        assert_eq!(config.shutdown_delay(), DelayPolicy::from_secs(15));
        assert_eq!(config.component_or("controller"), "custom");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn empty_probes_port_means_default() {
        let config = config(&[("PROBES_PORT", "  ")]);
        assert_eq!(config.probes_port().unwrap(), 8081);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config(&[("PROBES_PORT", "http")]).probes_port().is_err());

        let env: HashMap<String, String> =
            [("LOG_FORMAT".to_string(), "xml".to_string())].into();
        assert!(ProcessConfig::init_from_hashmap(&env).is_err());
    }
}
