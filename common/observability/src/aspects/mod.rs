//! The observability aspects and the keys they read.

mod logging;
mod otel;
mod profiling;
mod prometheus;
mod status;

pub use self::logging::{LoggingAspect, LoggingSettings, LOGGING_SOURCE};
pub use self::otel::{TracingAspect, TracingBackend, TracingSettings, TRACING_SOURCE};
pub use self::profiling::{ProfilingAspect, ProfilingSettings};
pub use self::prometheus::{MetricsAspect, MetricsBackend, MetricsSettings};
pub use self::status::{ReportOutcome, StatusAspect, StatusReporter, StatusSettings};

use std::str::FromStr;
use std::sync::Arc;

use crate::aspect::ConfigData;
use crate::error::AspectError;

pub const OBSERVABILITY_SOURCE: &str = "config-observability";

/// Pushes a new value into a live subscriber layer, typically through a
/// `tracing_subscriber::reload::Handle`.
pub struct Reloader<T> {
    reload: Arc<dyn Fn(T) -> Result<(), String> + Send + Sync>,
}

impl<T> Reloader<T> {
    pub fn new<F>(reload: F) -> Self
    where
        F: Fn(T) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            reload: Arc::new(reload),
        }
    }

    /// Accepts every value and does nothing with it.
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    pub(crate) fn reload(&self, value: T) -> Result<(), AspectError> {
        (self.reload)(value).map_err(AspectError::Apply)
    }
}

impl<T> Clone for Reloader<T> {
    fn clone(&self) -> Self {
        Self {
            reload: self.reload.clone(),
        }
    }
}

pub(crate) fn parse_bool(data: &ConfigData, key: &str, default: bool) -> Result<bool, AspectError> {
    match data.get(key).map(|raw| raw.trim()) {
        None | Some("") => Ok(default),
        Some(raw) if raw.eq_ignore_ascii_case("true") => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") => Ok(false),
        Some(raw) => Err(AspectError::invalid(key, format!("expected true or false, got '{raw}'"))),
    }
}

pub(crate) fn parse_value<T>(data: &ConfigData, key: &str, default: T) -> Result<T, AspectError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match data.get(key).map(|raw| raw.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|e| AspectError::invalid(key, e)),
    }
}
