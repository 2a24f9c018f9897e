/// Resolves when the process is asked to stop, so long-running services can
/// `select!` it against their work loop.
///
/// Unix listens for both SIGINT (operator terminal) and SIGTERM
/// (supervisor); elsewhere only Ctrl+C is available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        tracing::info!(signal = received, "stop requested");
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        tracing::info!(signal = "ctrl-c", "stop requested");
    }
}
