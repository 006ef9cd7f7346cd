//! Cancellable execution scopes.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a [`Lifetime`] was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// The shutdown coordinator's delay elapsed after a termination request.
    Shutdown,
    /// A runner returned a fatal outcome and its siblings are being stopped.
    RunnerFailed { runner: String },
    /// The probe server stopped serving after it was bound.
    ProbeServerFailed,
    Requested { reason: String },
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Shutdown => write!(f, "shutdown"),
            CancelCause::RunnerFailed { runner } => write!(f, "runner '{runner}' failed"),
            CancelCause::ProbeServerFailed => write!(f, "probe server failed"),
            CancelCause::Requested { reason } => write!(f, "requested: {reason}"),
        }
    }
}

/// Cancellable scope bounding how long dependent work may run.
///
/// Cancelling a lifetime cancels every lifetime derived from it with
/// [`child`](Lifetime::child). Cancelling a child never affects its parent or
/// its siblings. The first cause passed to [`cancel`](Lifetime::cancel) wins;
/// a child cancelled through its parent reports the parent's cause.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<LifetimeInner>,
}

struct LifetimeInner {
    token: CancellationToken,
    cause: OnceLock<CancelCause>,
    parent: Option<Lifetime>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LifetimeInner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Lifetime {
        Lifetime {
            inner: Arc::new(LifetimeInner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this lifetime and everything derived from it. Returns true if
    /// this call did the cancelling.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        let first = self.inner.cause.set(cause).is_ok();
        self.inner.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once this lifetime is cancelled. Use in `tokio::select!` to
    /// break out of work loops.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Owned variant of [`cancelled`](Lifetime::cancelled), for handing to
    /// spawned tasks and graceful-shutdown hooks.
    pub fn cancelled_owned(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.token.clone();
        async move { token.cancelled().await }
    }

    pub fn cause(&self) -> Option<CancelCause> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(cause.clone());
        }
        if !self.inner.token.is_cancelled() {
            return None;
        }
        self.inner.parent.as_ref().and_then(Lifetime::cause)
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}
