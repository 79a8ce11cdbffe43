use std::time::Instant;

use axum::{Router, routing::get};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

/// Serves `/metrics` (Prometheus text exposition of `registry`), `/healthz`
/// and `/readyz` on `port` until the process receives a shutdown signal.
///
/// Every controller's `ControllerMetrics` registers its vectors against the
/// process-wide default registry (distinct metric-name prefixes per
/// controller keep them from colliding), so one registry gathered here
/// covers all of them.
#[cfg(feature = "metrics")]
pub async fn run_metrics_server(port: u16, registry: prometheus::Registry) {
    let metrics_route = get(move || {
        let registry = registry.clone();
        async move {
            use prometheus::Encoder;
            let encoder = prometheus::TextEncoder::new();
            let families = registry.gather();
            let mut buf = Vec::new();
            if let Err(e) = encoder.encode(&families, &mut buf) {
                eprintln!("{}", format!("failed to encode metrics: {e}").red());
            }
            buf
        }
    });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route);

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("🛑 failed to bind metrics server to {addr}: {e}").red());
            return;
        }
    };
    println!(
        "{}{}",
        "📈 starting metrics server • port=".green(),
        port.to_string().green().dimmed(),
    );
    let started = Instant::now();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("{}", format!("metrics server error: {e}").red());
    }
    println!(
        "{} {}",
        "🛑 metrics server stopped gracefully • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}
