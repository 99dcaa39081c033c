//! Process shutdown signals.

use std::future::Future;
use std::io;
use tokio::signal::unix::{SignalKind, signal};

/// Listen for SIGINT and SIGTERM.
///
/// Handlers are installed before this returns, so a signal arriving while the
/// rest of the process starts up is not lost. The future resolves with the
/// name of the first signal received.
pub fn shutdown_signal() -> io::Result<impl Future<Output = &'static str>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}
