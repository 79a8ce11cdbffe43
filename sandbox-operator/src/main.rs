use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;

mod bypass;
mod conditions;
mod config;
mod events;
mod expectations;
mod gc;
mod hash;
mod inplace;
mod sandbox;
mod util;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sandbox_common::init();
    let config = Config::parse();
    let namespace = config::pod_namespace();

    let client = Client::try_default().await?;

    #[cfg(feature = "metrics")]
    if let Some(port) = config.metrics_port {
        tokio::spawn(sandbox_common::metrics::run_metrics_server(port, prometheus::default_registry().clone()));
    }

    println!("{}", format!("🧭 sandbox-operator starting in namespace {namespace}").green());

    let sandbox_client = client.clone();
    let bypass_client = client.clone();
    let gc_client = client.clone();
    let sandbox_workers = config.sandbox_workers;
    let bypass_workers = config.bypass_workers;
    let gc_interval = std::time::Duration::from_secs(config.gc_interval_secs);
    let gc_concurrency = config.gc_concurrency;
    let provider_endpoint = config.provider_endpoint.clone();

    let sandbox_task = tokio::spawn(async move {
        if let Err(e) = sandbox::run(sandbox_client, sandbox_workers).await {
            eprintln!("{}", format!("sandbox controller exited: {e}").red());
        }
    });
    let bypass_task = tokio::spawn(async move {
        if let Err(e) = bypass::run(bypass_client, bypass_workers).await {
            eprintln!("{}", format!("bypass controller exited: {e}").red());
        }
    });
    let gc_task = tokio::spawn(async move {
        if let Err(e) = gc::run(gc_client, gc_interval, gc_concurrency, &provider_endpoint).await {
            eprintln!("{}", format!("dangling-instance GC exited: {e}").red());
        }
    });

    let _ = tokio::join!(sandbox_task, bypass_task, gc_task);
    Ok(())
}
