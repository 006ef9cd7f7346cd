use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::trace::TraceError;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::warn;
use url::Url;

use super::{parse_bool, parse_value, Reloader};
use crate::aspect::{Aspect, ConfigData};
use crate::error::AspectError;

pub const TRACING_SOURCE: &str = "config-tracing";

const BACKEND_KEY: &str = "backend";
const ENDPOINT_KEY: &str = "endpoint";
const SAMPLE_RATE_KEY: &str = "sample-rate";
const DEBUG_KEY: &str = "debug";
const DEFAULT_SAMPLE_RATE: f64 = 0.1;

#[derive(Clone, Debug, PartialEq)]
pub enum TracingBackend {
    None,
    Otlp { endpoint: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TracingSettings {
    pub backend: TracingBackend,
    pub sample_rate: f64,
}

/// Exports spans over OTLP when `config-tracing` selects a backend. The
/// `tracing-opentelemetry` layer is swapped in and out through a reload handle.
pub struct TracingAspect {
    service_name: String,
    reloader: Reloader<Option<Tracer>>,
}

impl TracingAspect {
    pub fn new(service_name: impl Into<String>, reloader: Reloader<Option<Tracer>>) -> Self {
        Self {
            service_name: service_name.into(),
            reloader,
        }
    }
}

#[async_trait]
impl Aspect for TracingAspect {
    type Settings = TracingSettings;
    const NAME: &'static str = "tracing";

    fn source(&self) -> &'static str {
        TRACING_SOURCE
    }

    fn defaults(&self) -> TracingSettings {
        TracingSettings {
            backend: TracingBackend::None,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    fn parse(&self, data: &ConfigData) -> Result<TracingSettings, AspectError> {
        let backend = match data.get(BACKEND_KEY).map(|raw| raw.trim().to_ascii_lowercase()) {
            None => TracingBackend::None,
            Some(raw) => match raw.as_str() {
                "" | "none" => TracingBackend::None,
                "otlp" => TracingBackend::Otlp {
                    endpoint: parse_endpoint(data)?,
                },
                other => {
                    return Err(AspectError::invalid(
                        BACKEND_KEY,
                        format!("unsupported backend '{other}'"),
                    ))
                }
            },
        };

        let sample_rate = if parse_bool(data, DEBUG_KEY, false)? {
            1.0
        } else {
            let rate: f64 = parse_value(data, SAMPLE_RATE_KEY, DEFAULT_SAMPLE_RATE)?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(AspectError::invalid(
                    SAMPLE_RATE_KEY,
                    format!("{rate} is outside 0.0..=1.0"),
                ));
            }
            rate
        };

        Ok(TracingSettings {
            backend,
            sample_rate,
        })
    }

    async fn apply(&self, settings: &TracingSettings) -> Result<(), AspectError> {
        match &settings.backend {
            TracingBackend::None => {
                self.reloader.reload(None)?;
                // Flush whatever the previous exporter still buffers.
                if let Err(e) =
                    tokio::task::spawn_blocking(opentelemetry::global::shutdown_tracer_provider)
                        .await
                {
                    warn!(error = %e, "failed to shut down tracer provider");
                }
                Ok(())
            }
            TracingBackend::Otlp { endpoint } => {
                let tracer = init_tracer(endpoint, settings.sample_rate, &self.service_name)
                    .map_err(|e| AspectError::Apply(e.to_string()))?;
                self.reloader.reload(Some(tracer))
            }
        }
    }
}

fn parse_endpoint(data: &ConfigData) -> Result<String, AspectError> {
    let raw = data
        .get(ENDPOINT_KEY)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| AspectError::invalid(ENDPOINT_KEY, "required for the otlp backend"))?;
    let url = Url::parse(raw).map_err(|e| AspectError::invalid(ENDPOINT_KEY, e))?;
    match url.scheme() {
        "http" | "https" => Ok(raw.to_string()),
        scheme => Err(AspectError::invalid(
            ENDPOINT_KEY,
            format!("unsupported scheme '{scheme}'"),
        )),
    }
}

fn init_tracer(
    endpoint: &str,
    sampling_rate: f64,
    service_name: &str,
) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}
