use anyhow::Context;
use common_observability::aspects::Reloader;
use opentelemetry_sdk::trace::Tracer;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use crate::config::LogFormat;

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type OtelLayer = OpenTelemetryLayer<FilteredRegistry, Tracer>;
type TracedRegistry =
    Layered<reload::Layer<Option<OtelLayer>, FilteredRegistry>, FilteredRegistry>;

/// Live handles into the global subscriber, handed to the logging and
/// tracing aspects.
pub struct TracingReloaders {
    pub filter: Reloader<EnvFilter>,
    pub tracer: Reloader<Option<Tracer>>,
    /// The filter the subscriber was installed with, as a directive string.
    pub initial_directive: String,
}

/// Install the global subscriber:
///   - a reloadable filter, initially from RUST_LOG (default=INFO)
///   - a reloadable OpenTelemetry layer, initially absent
///   - stdout in text or json
pub fn setup_tracing(format: LogFormat) -> anyhow::Result<TracingReloaders> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let initial_directive = filter.to_string();
    let (filter_layer, filter_handle) = reload::Layer::new(filter);
    let (otel_layer, otel_handle) =
        reload::Layer::<Option<OtelLayer>, FilteredRegistry>::new(None);

    let log_layer: Box<dyn Layer<TracedRegistry> + Send + Sync> = match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(otel_layer)
        .with(log_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(TracingReloaders {
        initial_directive,
        filter: Reloader::new(move |filter: EnvFilter| {
            filter_handle.reload(filter).map_err(|e| e.to_string())
        }),
        tracer: Reloader::new(move |tracer: Option<Tracer>| {
            otel_handle
                .reload(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
                .map_err(|e| e.to_string())
        }),
    })
}
