// Cooperative shutdown: one CancellationToken cancelled by the signal handler
// and awaited by receive loops, dialogs and the scheduler.

use tokio_util::sync::CancellationToken;

/// Install a Ctrl+C handler that cancels `token`.
pub fn setup_signal_handler(token: CancellationToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        token.cancel();
    })
}
