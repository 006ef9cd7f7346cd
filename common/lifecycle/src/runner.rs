//! Long-running units of work owned by the supervisor.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::WaitForCancellationFuture;

use crate::lifetime::Lifetime;
use crate::readiness::ReadinessTracker;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Unrecoverable; the supervisor stops every other runner.
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A unit of work that runs until its context is cancelled.
///
/// Returning `Ok(())` means the runner finished cleanly, whether or not
/// cancellation was requested. Returning an error before cancellation stops
/// every sibling runner.
#[async_trait]
pub trait Runner: Send + 'static {
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunnerError>;
}

#[async_trait]
impl<F, Fut> Runner for F
where
    F: FnOnce(RunContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), RunnerError>> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunnerError> {
        (*self)(ctx).await
    }
}

/// Handed to each runner by the supervisor.
pub struct RunContext {
    name: String,
    lifetime: Lifetime,
    readiness: Arc<ReadinessTracker>,
    reported_ready: AtomicBool,
}

impl RunContext {
    pub(crate) fn new(name: &str, lifetime: Lifetime, readiness: Arc<ReadinessTracker>) -> Self {
        Self {
            name: name.to_string(),
            lifetime,
            readiness,
            reported_ready: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runner's own lifetime; derived from the supervisor's working
    /// lifetime, so it is cancelled when shutdown fires or a sibling fails.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.lifetime.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Report that this runner has started and is serving. The process turns
    /// ready once every runner has done so. Calling it again is a no-op.
    pub fn ready(&self) {
        if !self.reported_ready.swap(true, Ordering::SeqCst) {
            self.readiness.runner_ready();
        }
    }
}
