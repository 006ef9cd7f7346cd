pub(crate) const METRIC_SHUTDOWN_REQUESTS: &str = "lifecycle_shutdown_requests_total";
pub(crate) const METRIC_SHUTDOWN_DELAY: &str = "lifecycle_shutdown_delay_seconds";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";
pub(crate) const METRIC_RUNNER_EXITS: &str = "lifecycle_runner_exits_total";
pub(crate) const METRIC_READY: &str = "lifecycle_ready";

pub(crate) fn emit_shutdown_request(service_name: &str, signal: &str, outcome: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_REQUESTS,
        "service_name" => service_name.to_string(),
        "signal" => signal.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_delay(service_name: &str, delay_secs: f64) {
    metrics::histogram!(
        METRIC_SHUTDOWN_DELAY,
        "service_name" => service_name.to_string()
    )
    .record(delay_secs);
}

pub(crate) fn emit_shutdown_initiated(service_name: &str, cause: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "cause" => cause.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "clean" => clean.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_runner_exit(service_name: &str, runner: &str, result: &str) {
    metrics::counter!(
        METRIC_RUNNER_EXITS,
        "service_name" => service_name.to_string(),
        "runner" => runner.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_ready(service_name: &str, ready: bool) {
    metrics::gauge!(
        METRIC_READY,
        "service_name" => service_name.to_string()
    )
    .set(if ready { 1.0 } else { 0.0 });
}
