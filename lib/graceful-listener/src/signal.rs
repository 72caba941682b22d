//! Process signals that should start a graceful shutdown.
//!
//! A server usually runs its accept loop in a task and awaits [shutdown_stream] next to it. Once
//! the signal arrives it calls [GracefulListener::graceful_shutdown](crate::GracefulListener::graceful_shutdown)
//! and falls back to a hard close if the drain times out.

use std::io;

use tracing::info;

/// Resolves on the first SIGINT (ctrl-c), SIGTERM or SIGQUIT.
///
/// The handlers are installed when this is first polled; signals delivered before that use the
/// process defaults. Fails only if a handler can not be installed.
#[cfg(unix)]
pub async fn shutdown_stream() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    info!(signal = received, "Received shutdown signal");
    Ok(())
}

/// Resolves on ctrl-c, the only shutdown signal handled on windows.
#[cfg(windows)]
pub async fn shutdown_stream() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "Received shutdown signal");
    Ok(())
}
