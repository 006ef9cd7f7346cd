use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{parse_bool, OBSERVABILITY_SOURCE};
use crate::aspect::{Aspect, ConfigData};
use crate::error::AspectError;

const ENABLE_KEY: &str = "sink-event-error-reporting.enable";
const METRIC_STATUS_REPORTS: &str = "status_reports_total";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    Failed,
}

impl ReportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Delivered => "delivered",
            ReportOutcome::Failed => "failed",
        }
    }
}

/// Lets runners report event delivery outcomes. Reports are dropped while
/// reporting is disabled.
#[derive(Clone)]
pub struct StatusReporter {
    component: Arc<str>,
    enabled: Arc<AtomicBool>,
}

impl StatusReporter {
    pub fn new(component: &str) -> Self {
        Self {
            component: Arc::from(component),
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Returns whether the report was emitted.
    pub fn report(&self, outcome: ReportOutcome, target: &str, detail: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let component = &*self.component;
        match outcome {
            ReportOutcome::Delivered => {
                info!(component, outcome = outcome.as_str(), target, detail, "delivery status")
            }
            ReportOutcome::Failed => {
                warn!(component, outcome = outcome.as_str(), target, detail, "delivery status")
            }
        }
        metrics::counter!(
            METRIC_STATUS_REPORTS,
            "component" => self.component.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        true
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSettings {
    pub enabled: bool,
}

pub struct StatusAspect {
    reporter: StatusReporter,
}

impl StatusAspect {
    pub fn new(reporter: StatusReporter) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl Aspect for StatusAspect {
    type Settings = StatusSettings;
    const NAME: &'static str = "status";

    fn source(&self) -> &'static str {
        OBSERVABILITY_SOURCE
    }

    fn defaults(&self) -> StatusSettings {
        StatusSettings::default()
    }

    fn parse(&self, data: &ConfigData) -> Result<StatusSettings, AspectError> {
        Ok(StatusSettings {
            enabled: parse_bool(data, ENABLE_KEY, false)?,
        })
    }

    async fn apply(&self, settings: &StatusSettings) -> Result<(), AspectError> {
        self.reporter.set_enabled(settings.enabled);
        Ok(())
    }
}
