use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

use crate::shutdown::ShutdownRequest;

/// Trap SIGTERM and SIGINT and forward each one as a [`ShutdownRequest`].
/// The coordinator ignores everything after the first.
pub fn trap_termination_signals() -> std::io::Result<mpsc::Receiver<ShutdownRequest>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                Some(()) = term.recv() => ShutdownRequest::new("SIGTERM"),
                Some(()) = interrupt.recv() => ShutdownRequest::new("SIGINT"),
                else => break,
            };
            info!(signal = request.signal, "received termination signal");
            if tx.send(request).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
