use std::net::SocketAddr;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use super::{parse_value, OBSERVABILITY_SOURCE};
use crate::aspect::{Aspect, ConfigData};
use crate::error::AspectError;
use crate::listener::ListenerSlot;

const BACKEND_KEY: &str = "metrics.backend-destination";
const PORT_KEY: &str = "metrics.prometheus-port";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricsBackend {
    Prometheus,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetricsSettings {
    pub backend: MetricsBackend,
    pub port: u16,
}

/// Serves the Prometheus `/metrics` route on the configured port.
pub struct MetricsAspect {
    handle: PrometheusHandle,
    default_port: u16,
    listener: ListenerSlot,
}

impl MetricsAspect {
    pub fn new(handle: PrometheusHandle, default_port: u16) -> Self {
        Self {
            handle,
            default_port,
            listener: ListenerSlot::new("metrics"),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().await
    }

    fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route("/metrics", get(move || std::future::ready(handle.render())))
            .layer(axum::middleware::from_fn(health::track_metrics))
    }
}

#[async_trait]
impl Aspect for MetricsAspect {
    type Settings = MetricsSettings;
    const NAME: &'static str = "metrics";

    fn source(&self) -> &'static str {
        OBSERVABILITY_SOURCE
    }

    fn defaults(&self) -> MetricsSettings {
        MetricsSettings {
            backend: MetricsBackend::Prometheus,
            port: self.default_port,
        }
    }

    fn parse(&self, data: &ConfigData) -> Result<MetricsSettings, AspectError> {
        let backend = match data.get(BACKEND_KEY).map(|raw| raw.trim().to_ascii_lowercase()) {
            None => MetricsBackend::Prometheus,
            Some(raw) => match raw.as_str() {
                "" | "prometheus" => MetricsBackend::Prometheus,
                "none" => MetricsBackend::None,
                other => {
                    return Err(AspectError::invalid(
                        BACKEND_KEY,
                        format!("unsupported backend '{other}'"),
                    ))
                }
            },
        };
        let port = parse_value(data, PORT_KEY, self.default_port)?;
        Ok(MetricsSettings { backend, port })
    }

    async fn apply(&self, settings: &MetricsSettings) -> Result<(), AspectError> {
        match settings.backend {
            MetricsBackend::Prometheus => {
                self.listener
                    .ensure(settings.port, || self.router())
                    .await
            }
            MetricsBackend::None => {
                self.listener.clear().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::aspect::tests::data;

    fn aspect() -> MetricsAspect {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        MetricsAspect::new(handle, 0)
    }

    #[test]
    fn parses_backend_and_port() {
        let aspect = aspect();
        assert_eq!(
            aspect.parse(&data(&[])).unwrap(),
            MetricsSettings {
                backend: MetricsBackend::Prometheus,
                port: 0
            }
        );
        assert_eq!(
            aspect
                .parse(&data(&[
                    ("metrics.backend-destination", "None"),
                    ("metrics.prometheus-port", "9091")
                ]))
                .unwrap(),
            MetricsSettings {
                backend: MetricsBackend::None,
                port: 9091
            }
        );
        assert!(aspect
            .parse(&data(&[("metrics.backend-destination", "opencensus")]))
            .is_err());
        assert!(aspect
            .parse(&data(&[("metrics.prometheus-port", "70000")]))
            .is_err());
    }

    #[tokio::test]
    async fn serves_until_disabled() {
        let aspect = aspect();
        aspect.apply(&aspect.defaults()).await.unwrap();
        let addr = aspect.local_addr().await.unwrap();

        let response = reqwest::get(format!("http://127.0.0.1:{}/metrics", addr.port()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.text().await.unwrap();

        aspect
            .apply(&MetricsSettings {
                backend: MetricsBackend::None,
                port: 0,
            })
            .await
            .unwrap();
        assert_eq!(aspect.local_addr().await, None);
    }
}
