//! HTTP listeners owned by an aspect and rebound when its settings change.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AspectError;

/// How long in-flight requests get once a listener is told to stop. A
/// profile capture can otherwise hold the listener for minutes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Served {
    requested_port: u16,
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Served {
    async fn bind(name: &'static str, port: u16, router: Router) -> Result<Self, AspectError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async move {
                // A dropped sender also means stop.
                stopped.await.ok();
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(listener = name, error = %e, "listener stopped with error");
            }
        });

        info!(listener = name, address = %local_addr, "listener started");
        Ok(Self {
            requested_port: port,
            local_addr,
            stop,
            task,
        })
    }

    async fn shutdown(self, name: &'static str, grace: Duration) {
        let Served {
            local_addr,
            stop,
            mut task,
            ..
        } = self;
        // The task may already have exited; nothing else to do then.
        stop.send(()).ok();
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(listener = name, error = %e, "listener task failed"),
            Err(_) => {
                warn!(
                    listener = name,
                    grace_secs = grace.as_secs_f64(),
                    "requests still in flight, aborting listener"
                );
                task.abort();
            }
        }
        info!(listener = name, address = %local_addr, "listener stopped");
    }
}

/// At most one running listener. Only the pipeline writer calls into it.
pub(crate) struct ListenerSlot {
    name: &'static str,
    grace: Duration,
    current: Mutex<Option<Served>>,
}

impl ListenerSlot {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            grace: SHUTDOWN_GRACE,
            current: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Serve `router()` on `port`. Keeps the running listener when it already
    /// serves that port; otherwise the new port is bound before the old
    /// listener is released, so a failed bind leaves the old one running.
    pub(crate) async fn ensure(
        &self,
        port: u16,
        router: impl FnOnce() -> Router,
    ) -> Result<(), AspectError> {
        let mut current = self.current.lock().await;
        if matches!(current.as_ref(), Some(served) if served.requested_port == port && port != 0) {
            return Ok(());
        }

        let next = Served::bind(self.name, port, router()).await?;
        if let Some(previous) = current.replace(next) {
            previous.shutdown(self.name, self.grace).await;
        }
        Ok(())
    }

    pub(crate) async fn clear(&self) {
        if let Some(previous) = self.current.lock().await.take() {
            previous.shutdown(self.name, self.grace).await;
        }
    }

    pub(crate) async fn local_addr(&self) -> Option<SocketAddr> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|served| served.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    fn router() -> Router {
        Router::new().route("/", get(|| async { "hi" }))
    }

    #[tokio::test]
    async fn rebinds_and_clears() {
        let slot = ListenerSlot::new("test");
        assert_eq!(slot.local_addr().await, None);

        slot.ensure(0, router).await.unwrap();
        let first = slot.local_addr().await.unwrap();
        let body = reqwest::get(format!("http://127.0.0.1:{}/", first.port()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hi");

        slot.ensure(0, router).await.unwrap();
        let second = slot.local_addr().await.unwrap();
        assert_ne!(first.port(), second.port());
        assert!(reqwest::get(format!("http://127.0.0.1:{}/", first.port()))
            .await
            .is_err());

        slot.clear().await;
        assert_eq!(slot.local_addr().await, None);
    }

    #[tokio::test]
    async fn clear_aborts_requests_that_outlive_the_grace_period() {
        let slot = ListenerSlot::new("test").with_grace(Duration::from_millis(200));
        let hanging = || Router::new().route("/", get(|| std::future::pending::<&'static str>()));
        slot.ensure(0, hanging).await.unwrap();
        let addr = slot.local_addr().await.unwrap();

        let request = tokio::spawn(reqwest::get(format!("http://127.0.0.1:{}/", addr.port())));
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), slot.clear())
            .await
            .expect("clear should not wait for the hanging request");
        assert_eq!(slot.local_addr().await, None);
        request.abort();
    }

    #[tokio::test]
    async fn failed_bind_keeps_running_listener() {
        let slot = ListenerSlot::new("test");
        slot.ensure(0, router).await.unwrap();
        let running = slot.local_addr().await.unwrap();

        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let err = slot.ensure(taken_port, router).await.unwrap_err();
        assert!(matches!(err, AspectError::Io(_)));
        assert_eq!(slot.local_addr().await, Some(running));
    }
}
