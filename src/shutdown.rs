use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned root token on SIGTERM or SIGINT.
///
/// Every job token is a child of this token, so a signal aborts all in-flight
/// datums and stops further dispatch.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token_clone = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, cancelling running jobs");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, cancelling running jobs");
            }
        }
        token_clone.cancel();
    });

    Ok(token)
}
