//! Signal handling for graceful shutdown

use crate::engine::CancellationToken;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if shutdown has been requested
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Request shutdown and cancel the running graph
pub fn request_shutdown(token: &CancellationToken) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    token.cancel();
}

/// Wait for SIGINT/SIGTERM (Ctrl+C elsewhere) and cancel `token`
///
/// The step in flight finishes; the walker stops before the next one.
pub async fn setup_signal_handlers(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(int), Ok(term)) => (int, term),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("\nReceived SIGINT, cancelling run...");
            }
            _ = sigterm.recv() => {
                eprintln!("\nReceived SIGTERM, cancelling run...");
            }
        }

        request_shutdown(&token);
    }

    #[cfg(not(unix))]
    {
        use tokio::signal::ctrl_c;

        if let Err(e) = ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        eprintln!("\nReceived Ctrl+C, cancelling run...");
        request_shutdown(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shutdown_cancels_token() {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        let observer = token.clone();

        assert!(!is_shutdown_requested());
        request_shutdown(&token);

        assert!(is_shutdown_requested());
        assert!(observer.is_cancelled());

        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
