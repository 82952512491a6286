//! Shutdown signal handling

use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and SIGINT
///
/// The returned token is cancelled when either signal arrives. Task tokens
/// are children of it, so the in-flight task is stopped too.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => log::info!("Received {}, shutting down", name),
            Err(e) => {
                log::error!("Failed to install signal handlers: {}", e);
                return;
            }
        }
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
