use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT
///
/// The returned token is cancelled on the first signal. The HTTP server,
/// the heartbeat monitor and the collector worker all stop on it.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
        }

        trigger.cancel();
    });

    Ok(token)
}
