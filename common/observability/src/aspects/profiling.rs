use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::protos::Message;
use pprof::ProfilerGuardBuilder;
use serde::Deserialize;
use tokio::time::sleep;

use super::{parse_bool, OBSERVABILITY_SOURCE};
use crate::aspect::{Aspect, ConfigData};
use crate::error::AspectError;
use crate::listener::ListenerSlot;

const ENABLE_KEY: &str = "profiling.enable";
const DEFAULT_SECONDS: u64 = 30;
const MAX_SECONDS: u64 = 300;
const DEFAULT_FREQUENCY: i32 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfilingSettings {
    pub enabled: bool,
}

/// Runs the CPU profiling listener while `profiling.enable` is true.
pub struct ProfilingAspect {
    port: u16,
    listener: ListenerSlot,
}

impl ProfilingAspect {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener: ListenerSlot::new("profiling"),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().await
    }
}

#[async_trait]
impl Aspect for ProfilingAspect {
    type Settings = ProfilingSettings;
    const NAME: &'static str = "profiling";

    fn source(&self) -> &'static str {
        OBSERVABILITY_SOURCE
    }

    fn defaults(&self) -> ProfilingSettings {
        ProfilingSettings::default()
    }

    fn parse(&self, data: &ConfigData) -> Result<ProfilingSettings, AspectError> {
        Ok(ProfilingSettings {
            enabled: parse_bool(data, ENABLE_KEY, false)?,
        })
    }

    async fn apply(&self, settings: &ProfilingSettings) -> Result<(), AspectError> {
        if settings.enabled {
            self.listener.ensure(self.port, router).await
        } else {
            self.listener.clear().await;
            Ok(())
        }
    }
}

fn router() -> Router {
    Router::new()
        .route("/debug/pprof/profile", get(handle_profile_report))
        .layer(axum::middleware::from_fn(health::track_metrics))
}

#[derive(Deserialize)]
struct ProfileQueryParams {
    // seconds to run the profiler before taking the snapshot
    seconds: Option<u64>,
    // sample frequency in Hz
    frequency: Option<i32>,
}

// curl -sSL "http://<POD_IP>:8008/debug/pprof/profile?seconds=10&frequency=200" > profile.pb.gz
async fn handle_profile_report(Query(params): Query<ProfileQueryParams>) -> Response {
    let seconds = params.seconds.unwrap_or(DEFAULT_SECONDS).min(MAX_SECONDS);
    let frequency = params.frequency.unwrap_or(DEFAULT_FREQUENCY);

    match generate_report(frequency, seconds).await {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "application/octet-stream")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain")],
            format!("{e:#}"),
        )
            .into_response(),
    }
}

async fn generate_report(frequency: i32, seconds: u64) -> Result<Vec<u8>> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to build profiler guard")?;

    sleep(Duration::from_secs(seconds)).await;

    let profile = guard
        .report()
        .build()
        .context("Failed to build profiler report")?
        .pprof()
        .context("Failed to build profiler profile")?;

    let mut body = Vec::new();
    let mut encoder = GzEncoder::new(&mut body, Compression::default());
    profile
        .write_to_writer(&mut encoder)
        .context("Failed to write profile to writer")?;
    encoder
        .finish()
        .context("Failed to finish encoding profile")?;

    Ok(body)
}
