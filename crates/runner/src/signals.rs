//! Termination signals
//!
//! SIGTERM and SIGINT (orchestrator scale-down, spot reclaim, Ctrl-C) cancel
//! the worker's token. Everything that supervises a child selects on it.

use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancel `token` on the first SIGTERM or SIGINT.
pub fn cancel_on_signals(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = token.cancelled() => return,
        };
        warn!("{} caught, bailing out", name);
        token.cancel();
    }))
}
