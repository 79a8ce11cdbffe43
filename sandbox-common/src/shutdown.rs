use owo_colors::OwoColorize;

/// Resolves once SIGINT or SIGTERM is received (Ctrl+C locally, pod eviction
/// in cluster). Used both to gate `axum::serve`'s graceful shutdown and to
/// cancel the leader-election loops in `main`.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => eprintln!("{}", "🛑 received SIGINT".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 received SIGTERM".red()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}
