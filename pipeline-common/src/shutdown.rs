use tokio::signal;
use tracing::{error, info};

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    let (mut term, mut interrupt) = match (
        signal::unix::signal(signal::unix::SignalKind::terminate()),
        signal::unix::signal(signal::unix::SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(interrupt)) => (term, interrupt),
        (Err(e), _) | (_, Err(e)) => {
            error!("failed to register signal handlers, falling back to ctrl-c: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}
