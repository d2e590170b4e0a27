use anyhow::{Context, Result};
use tokio::signal;

/// Wait for shutdown signal (SIGINT, SIGTERM on Unix; Ctrl+C elsewhere)
///
/// Returns Result to allow proper error handling during signal handler
/// installation; the shutdown_signal_handler() wrapper provides the plain
/// () return axum's graceful shutdown wants.
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv()  => {
                tracing::info!("Received SIGINT signal");
            },
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C signal");
    }

    Ok(())
}

/// Wrapper that logs signal-handling errors instead of propagating them.
pub async fn shutdown_signal_handler() {
    if let Err(e) = shutdown_signal().await {
        tracing::error!("Error setting up shutdown handler: {}", e);
    }
}
