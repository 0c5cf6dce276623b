//! OS signal handling.
//!
//! SIGINT, SIGTERM and SIGQUIT all request a graceful shutdown by cancelling
//! the shared token. On non-Unix platforms only Ctrl-C is observed.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "shutdown signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}

/// Cancel `token` on the first shutdown signal
///
/// If the handlers cannot be installed the token is cancelled right away.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            waited = wait_for_shutdown_signal() => {
                if let Err(e) = waited {
                    warn!(error = %e, "failed to install signal handlers");
                }
                token.cancel();
            }
        }
    })
}
