//! OS signal handling.

/// Resolve when the process receives Ctrl-C / SIGINT.
///
/// If the handler cannot be installed the future never resolves, so the
/// caller's other `select!` branches still decide when to stop.
pub async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received, shutting down"),
        Err(err) => {
            tracing::error!(error = %err, "Failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    }
}
