//! Process signal handling.

use tokio_util::sync::CancellationToken;

/// Cancel `cancel` on SIGINT (Ctrl-C) or, on unix, SIGTERM.
pub async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable; listening for Ctrl-C only");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}
