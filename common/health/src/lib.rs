//! Liveness and readiness probes for the control processes.
//!
//! The probe listener lives on its own port with a lifecycle independent of the
//! control loops: the orchestrating platform must be able to reach it from the
//! moment the process starts until it exits. An unreachable probe endpoint is
//! indistinguishable from a dead process, so failing to bind is fatal to the
//! caller and never retried here.
//!
//! Both endpoints answer 200 while the process is up. `ProbeState` tracks
//! whether the control loops have finished starting; it is reported in the
//! readiness body, and only changes the status code when strict readiness is
//! enabled.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Probe port used when `PROBES_PORT` is not set.
pub const DEFAULT_PROBES_PORT: u16 = 8081;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to bind probe listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("probe server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Process-wide readiness flag. Starts out "not ready"; cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct ProbeState {
    ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip to ready, returns true if the state changed.
    pub fn set_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::SeqCst)
    }

    /// Flip to not ready, returns true if the state changed.
    pub fn set_not_ready(&self) -> bool {
        self.ready.swap(false, Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Readiness answer. Implements [`IntoResponse`] for axum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub strict: bool,
}

impl IntoResponse for ReadinessStatus {
    fn into_response(self) -> Response {
        let body = if self.ready { "ready" } else { "not ready" };
        let status = if self.ready || !self.strict {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, body).into_response()
    }
}

#[derive(Clone)]
struct ProbeContext {
    state: ProbeState,
    strict_readiness: bool,
}

/// Probe routes: `/health` and `/readiness`, with HTTP metrics.
pub fn router(state: ProbeState, strict_readiness: bool) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .with_state(ProbeContext {
            state,
            strict_readiness,
        })
        .layer(axum::middleware::from_fn(track_metrics))
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readiness(State(ctx): State<ProbeContext>) -> ReadinessStatus {
    ReadinessStatus {
        ready: ctx.state.is_ready(),
        strict: ctx.strict_readiness,
    }
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

pub struct ProbeServer {
    port: u16,
    state: ProbeState,
    strict_readiness: bool,
}

impl ProbeServer {
    pub fn new(port: u16, state: ProbeState) -> Self {
        Self {
            port,
            state,
            strict_readiness: false,
        }
    }

    /// Answer 503 on `/readiness` until the state flips to ready.
    pub fn with_strict_readiness(mut self, strict: bool) -> Self {
        self.strict_readiness = strict;
        self
    }

    /// Bind the probe listener on all interfaces. The server is reachable once
    /// this returns, even before [`BoundProbeServer::serve`] is polled: the
    /// kernel queues incoming connections.
    pub async fn bind(self) -> Result<BoundProbeServer, ProbeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProbeError::Bind {
                port: self.port,
                source,
            })?;

        info!(
            port = self.port,
            strict_readiness = self.strict_readiness,
            "Readiness and health check server listening"
        );

        Ok(BoundProbeServer {
            listener,
            router: router(self.state, self.strict_readiness),
        })
    }
}

pub struct BoundProbeServer {
    listener: TcpListener,
    router: Router,
}

impl BoundProbeServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ProbeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve probes until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ProbeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Probe server stopped");
        Ok(())
    }
}
