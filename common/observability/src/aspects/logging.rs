use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use super::Reloader;
use crate::aspect::{Aspect, ConfigData};
use crate::error::AspectError;

pub const LOGGING_SOURCE: &str = "config-logging";

const LOGLEVEL_KEY: &str = "loglevel";
const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info` or `info,hyper=warn`.
    pub directive: String,
}

/// Hot-reloads the global log filter from `config-logging`.
///
/// `loglevel` sets the level for the whole process; `loglevel.<component>`
/// takes precedence for the component this process runs as.
pub struct LoggingAspect {
    component: String,
    initial: String,
    reloader: Reloader<EnvFilter>,
}

impl LoggingAspect {
    pub fn new(component: impl Into<String>, reloader: Reloader<EnvFilter>) -> Self {
        Self {
            component: component.into(),
            initial: DEFAULT_DIRECTIVE.to_string(),
            reloader,
        }
    }

    /// Directive the process started with (usually from `RUST_LOG`). It is
    /// kept until `config-logging` sets a level.
    pub fn with_initial_directive(mut self, directive: impl Into<String>) -> Self {
        self.initial = directive.into();
        self
    }

    fn component_key(&self) -> String {
        format!("{LOGLEVEL_KEY}.{}", self.component)
    }
}

#[async_trait]
impl Aspect for LoggingAspect {
    type Settings = LoggingSettings;
    const NAME: &'static str = "logging";

    fn source(&self) -> &'static str {
        LOGGING_SOURCE
    }

    fn defaults(&self) -> LoggingSettings {
        LoggingSettings {
            directive: self.initial.clone(),
        }
    }

    fn parse(&self, data: &ConfigData) -> Result<LoggingSettings, AspectError> {
        let component_key = self.component_key();
        let (key, raw) = match (data.get(&component_key), data.get(LOGLEVEL_KEY)) {
            (Some(raw), _) => (component_key.as_str(), raw.as_str()),
            (None, Some(raw)) => (LOGLEVEL_KEY, raw.as_str()),
            (None, None) => return Ok(self.defaults()),
        };
        let directive = to_directive(raw, &self.initial)
            .map_err(|reason| AspectError::invalid(key, reason))?;
        Ok(LoggingSettings { directive })
    }

    async fn apply(&self, settings: &LoggingSettings) -> Result<(), AspectError> {
        let filter = EnvFilter::try_new(&settings.directive)
            .map_err(|e| AspectError::invalid(LOGLEVEL_KEY, e))?;
        self.reloader.reload(filter)
    }
}

/// Accepts a bare level name or a full `EnvFilter` directive list.
fn to_directive(raw: &str, initial: &str) -> Result<String, String> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "" => Ok(initial.to_string()),
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(value),
        "warning" => Ok("warn".to_string()),
        "dpanic" | "panic" | "fatal" => Ok("error".to_string()),
        _ if value.contains('=') || value.contains(',') => EnvFilter::try_new(&value)
            .map(|_| value.clone())
            .map_err(|e| e.to_string()),
        _ => Err(format!("unknown log level '{value}'")),
    }
}
