//! # Shutdown signals for [`Runtime::run_until_signal`](crate::Runtime::run_until_signal).
//!
//! On unix the runtime stops on `SIGINT`, `SIGTERM` or `SIGQUIT`; elsewhere
//! on Ctrl-C only. Worker processes are not signalled here: they are stopped
//! through the engine escalation.

use std::io;

/// Completes with the name of the first shutdown signal received.
///
/// Listeners are registered per call; `Err` if registration fails.
#[cfg(unix)]
pub(crate) async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
