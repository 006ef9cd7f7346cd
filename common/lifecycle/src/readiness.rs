//! Aggregated readiness across supervised runners.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use health::ProbeState;
use tracing::info;

use crate::metrics;

/// Flips the shared [`ProbeState`] to ready once every runner has reported
/// ready, and back to not ready as soon as shutdown begins. Once stopping,
/// readiness never comes back.
pub(crate) struct ReadinessTracker {
    service: String,
    probe: ProbeState,
    pending: AtomicUsize,
    stopping: AtomicBool,
}

impl ReadinessTracker {
    pub(crate) fn new(service: &str, probe: ProbeState, runners: usize) -> Self {
        let tracker = Self {
            service: service.to_string(),
            probe,
            pending: AtomicUsize::new(runners),
            stopping: AtomicBool::new(false),
        };
        if runners == 0 {
            tracker.mark_ready();
        } else {
            metrics::emit_ready(&tracker.service, false);
        }
        tracker
    }

    /// Called once per runner.
    pub(crate) fn runner_ready(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            self.mark_ready();
        }
    }

    pub(crate) fn stopping(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.probe.set_not_ready() {
            info!("Lifecycle: shutdown started, reporting not ready");
        }
        metrics::emit_ready(&self.service, false);
    }

    fn mark_ready(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if self.probe.set_ready() {
            info!("Lifecycle: all runners ready");
        }
        // Shutdown may have started between the check and the flip.
        if self.stopping.load(Ordering::SeqCst) {
            self.probe.set_not_ready();
            return;
        }
        metrics::emit_ready(&self.service, true);
    }
}
