//! Process-level termination signals.
//!
//! SIGINT, SIGTERM and SIGQUIT on unix, Ctrl-C elsewhere. A signal has the
//! same effect as `POST /stop`: the controller drains and the API shuts down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::Controller;

/// Wait for a termination signal and return its name.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
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
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Stop `controller` and cancel `api_shutdown` on the first signal, or just
/// return once `api_shutdown` is cancelled some other way.
pub async fn watch_signals(controller: Arc<Controller>, api_shutdown: CancellationToken) {
    tokio::select! {
        signal = wait_for_shutdown_signal() => match signal {
            Ok(name) => info!(signal = name, "Received termination signal"),
            Err(e) => {
                error!(error = %e, "Failed to listen for termination signals");
                return;
            }
        },
        _ = api_shutdown.cancelled() => return,
    }

    controller.request_stop();
    api_shutdown.cancel();
}
