//! Signal-driven shutdown: SIGTERM or SIGINT cancels the shared token and
//! every long-running task drains from there.

use tokio_util::sync::CancellationToken;

/// Spawn the signal listener. The returned token is cloned into every
/// component that needs to stop cleanly.
pub fn install() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => tracing::info!("SIGTERM received"),
            r = tokio::signal::ctrl_c() => match r {
                Ok(()) => tracing::info!("SIGINT received"),
                Err(e) => tracing::error!(error = %e, "Signal wait failed"),
            },
        }
        trigger.cancel();
    });
    token
}
