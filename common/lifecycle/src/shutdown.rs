//! Delayed cancellation on termination requests.
//!
//! During a controller hand-off (old replica stopping, new replica not yet
//! active, or a passive replica not yet elected) honoring SIGTERM immediately
//! can lose events that only the terminating replica can still process. The
//! coordinator keeps the working lifetime alive for a fixed minimum delay after
//! the first termination request, so the platform can finish the hand-off
//! before this process stops doing work.
//!
//! ```text
//! Armed ──request──▶ Delaying ──deadline──▶ Cancelling
//!   │                   │ ▲
//!   │                   └─┘ further requests ignored
//!   └──request (zero delay)────────────────▶ Cancelling
//! ```

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::lifetime::{CancelCause, Lifetime};
use crate::metrics;

/// "The process received a termination request". Created by the signal layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub received_at: Instant,
    pub signal: &'static str,
}

impl ShutdownRequest {
    pub fn new(signal: &'static str) -> Self {
        Self::at(signal, Instant::now())
    }

    pub fn at(signal: &'static str, received_at: Instant) -> Self {
        Self {
            received_at,
            signal,
        }
    }
}

/// Minimum time between a [`ShutdownRequest`] and the actual cancellation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayPolicy(Duration);

impl DelayPolicy {
    pub const ZERO: DelayPolicy = DelayPolicy(Duration::ZERO);

    pub fn new(delay: Duration) -> Self {
        Self(delay)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn delay(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

/// `start + delay`, saturating to a deadline far enough out to never fire.
pub(crate) fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start.checked_add(delay).unwrap_or(start + FAR_FUTURE)
}

// Same horizon tokio uses internally for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl From<Duration> for DelayPolicy {
    fn from(delay: Duration) -> Self {
        Self(delay)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    /// Waiting for a termination request.
    Armed,
    /// A request was observed; cancellation happens at `deadline`.
    Delaying {
        requested_at: Instant,
        deadline: Instant,
    },
    /// Terminal: the working lifetime has been cancelled.
    Cancelling,
}

/// Converts termination requests into a delayed cancellation of the working
/// [`Lifetime`]. At most one delay cycle runs per process.
pub struct DelayingShutdownCoordinator {
    name: String,
    policy: DelayPolicy,
    lifetime: Lifetime,
    requested: CancellationToken,
    state: Mutex<ShutdownState>,
}

impl DelayingShutdownCoordinator {
    /// The working lifetime is derived from `parent`: cancelling the parent
    /// still stops everything immediately, the delay only applies to
    /// termination requests.
    pub fn new(name: &str, policy: DelayPolicy, parent: &Lifetime) -> Self {
        Self {
            name: name.to_string(),
            policy,
            lifetime: parent.child(),
            requested: CancellationToken::new(),
            state: Mutex::new(ShutdownState::Armed),
        }
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime.clone()
    }

    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    pub fn state(&self) -> ShutdownState {
        *self.lock_state()
    }

    /// Resolves once a termination request has been accepted, before the
    /// delay elapses. Used to stop advertising readiness early.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.requested.clone();
        async move { token.cancelled().await }
    }

    /// Feed one termination request through the state machine and return the
    /// resulting state. With a zero delay the lifetime is cancelled before
    /// this returns.
    pub fn observe(&self, request: ShutdownRequest) -> ShutdownState {
        let mut state = self.lock_state();
        match *state {
            ShutdownState::Armed => {
                metrics::emit_shutdown_request(&self.name, request.signal, "accepted");

                if self.policy.is_zero() {
                    info!(
                        signal = request.signal,
                        "Lifecycle: termination requested, cancelling immediately"
                    );
                    *state = ShutdownState::Cancelling;
                    self.cancel_lifetime(request.received_at);
                } else {
                    let deadline = deadline_after(request.received_at, self.policy.delay());
                    info!(
                        signal = request.signal,
                        delay_secs = self.policy.delay().as_secs_f64(),
                        "Lifecycle: termination requested, delaying cancellation"
                    );
                    *state = ShutdownState::Delaying {
                        requested_at: request.received_at,
                        deadline,
                    };
                }
                self.requested.cancel();
            }
            ShutdownState::Delaying { .. } | ShutdownState::Cancelling => {
                metrics::emit_shutdown_request(&self.name, request.signal, "ignored");
                debug!(
                    signal = request.signal,
                    state = ?*state,
                    "Lifecycle: termination already in progress, request ignored"
                );
            }
        }
        *state
    }

    /// Delaying → Cancelling. Returns true if this call cancelled the lifetime.
    pub fn fire(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            ShutdownState::Delaying { requested_at, .. } => {
                *state = ShutdownState::Cancelling;
                self.cancel_lifetime(requested_at);
                true
            }
            ShutdownState::Armed | ShutdownState::Cancelling => false,
        }
    }

    /// Drive the state machine from `requests` until the working lifetime is
    /// cancelled, by the delay elapsing or for any other reason.
    pub async fn run(&self, mut requests: mpsc::Receiver<ShutdownRequest>) {
        let mut requests_open = true;
        loop {
            let deadline = match self.state() {
                ShutdownState::Armed => None,
                ShutdownState::Delaying { deadline, .. } => Some(deadline),
                ShutdownState::Cancelling => return,
            };

            tokio::select! {
                biased;

                _ = self.lifetime.cancelled() => return,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire();
                }
                request = requests.recv(), if requests_open => match request {
                    Some(request) => {
                        self.observe(request);
                    }
                    None => requests_open = false,
                },
            }
        }
    }

    fn cancel_lifetime(&self, requested_at: Instant) {
        let waited = Instant::now().saturating_duration_since(requested_at);
        if self.lifetime.cancel(CancelCause::Shutdown) {
            metrics::emit_shutdown_delay(&self.name, waited.as_secs_f64());
            info!(
                waited_secs = waited.as_secs_f64(),
                "Lifecycle: shutdown delay elapsed, cancelling runners"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ShutdownState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(delay: Duration) -> (Lifetime, DelayingShutdownCoordinator) {
        let root = Lifetime::new();
        let coordinator =
            DelayingShutdownCoordinator::new("test", DelayPolicy::new(delay), &root);
        (root, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_cancels_synchronously() {
        let (_root, coordinator) = coordinator(Duration::ZERO);
        let lifetime = coordinator.lifetime();

        let state = coordinator.observe(ShutdownRequest::new("SIGTERM"));
        assert_eq!(state, ShutdownState::Cancelling);
        assert!(lifetime.is_cancelled());
        assert_eq!(lifetime.cause(), Some(CancelCause::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_keeps_first_deadline() {
        let (_root, coordinator) = coordinator(Duration::from_secs(5));
        let first = ShutdownRequest::new("SIGTERM");
        let expected = ShutdownState::Delaying {
            requested_at: first.received_at,
            deadline: first.received_at + Duration::from_secs(5),
        };

        assert_eq!(coordinator.observe(first), expected);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(coordinator.observe(ShutdownRequest::new("SIGINT")), expected);
        assert!(!coordinator.lifetime().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_only_acts_while_delaying() {
        let (_root, coordinator) = coordinator(Duration::from_secs(1));
        assert!(!coordinator.fire());
        assert_eq!(coordinator.state(), ShutdownState::Armed);

        coordinator.observe(ShutdownRequest::new("SIGTERM"));
        assert!(coordinator.fire());
        assert!(!coordinator.fire());
        assert_eq!(coordinator.state(), ShutdownState::Cancelling);
        assert_eq!(
            coordinator.observe(ShutdownRequest::new("SIGTERM")),
            ShutdownState::Cancelling
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_requested_resolves_before_cancellation() {
        let (_root, coordinator) = coordinator(Duration::from_secs(30));
        let requested = tokio::spawn(coordinator.shutdown_requested());

        coordinator.observe(ShutdownRequest::new("SIGTERM"));
        requested.await.unwrap();
        assert!(!coordinator.lifetime().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delay_still_delays() {
        let root = Lifetime::new();
        let coordinator =
            DelayingShutdownCoordinator::new("test", DelayPolicy::from_secs(u64::MAX), &root);
        let request = ShutdownRequest::new("SIGTERM");

        match coordinator.observe(request) {
            ShutdownState::Delaying { deadline, .. } => {
                assert!(deadline > request.received_at + Duration::from_secs(86400 * 365))
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(!coordinator.lifetime().is_cancelled());

        // Cancellation still works through the parent.
        root.cancel(CancelCause::Requested {
            reason: "test".into(),
        });
        assert!(coordinator.lifetime().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_bypasses_delay() {
        let (root, coordinator) = coordinator(Duration::from_secs(60));
        let (_tx, rx) = mpsc::channel(1);

        root.cancel(CancelCause::RunnerFailed {
            runner: "broker".into(),
        });
        coordinator.run(rx).await;

        assert_eq!(coordinator.state(), ShutdownState::Armed);
        assert_eq!(
            coordinator.lifetime().cause(),
            Some(CancelCause::RunnerFailed {
                runner: "broker".into()
            })
        );
    }
}
