mod finalizer_release;
pub mod provider;
mod sweep;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::util::Error;
use provider::GrpcComputeProvider;

/// Entrypoint for the dangling-instance GC (§4.9): a periodic sweep against
/// the external compute provider plus a dedicated finalizer-release
/// reconciler, both sharing one provider connection.
pub async fn run(client: Client, interval: Duration, concurrency: usize, provider_endpoint: &str) -> Result<(), Error> {
    let provider: Arc<dyn provider::ComputeProvider> = Arc::new(GrpcComputeProvider::connect(provider_endpoint).await?);

    let sweep_client = client.clone();
    let sweep_provider = provider.clone();
    let sweep_task = tokio::spawn(async move { sweep::run(sweep_client, sweep_provider, interval, concurrency).await });

    let release_result = finalizer_release::run(client, provider).await;
    sweep_task.abort();
    release_result
}
