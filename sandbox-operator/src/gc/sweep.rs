use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::{Api, Client, ResourceExt, api::ListParams};
use sandbox_types::Sandbox;
use tokio::sync::Semaphore;
use tokio::time::{MissedTickBehavior, interval};

use crate::util::Error;

use super::provider::{ComputeProvider, PausedInstance};

const DELETE_CONCURRENCY: usize = 100;
const DELETE_RATE: Duration = Duration::from_millis(10);

/// Whether a paused instance reported by the provider has no backing Sandbox
/// any more, or no longer matches the Sandbox that owns its (namespace,
/// name), the duplicate-leak case from §4.9 step 2.
pub fn should_delete_instance(sandboxes: &HashMap<(String, String), Sandbox>, instance: &PausedInstance) -> bool {
    let key = (instance.namespace.clone(), instance.name.clone());
    match sandboxes.get(&key) {
        None => true,
        Some(sandbox) => {
            let recorded = sandbox.status.as_ref().and_then(|s| s.pod_info.as_ref()).and_then(|p| p.pod_uid.as_deref());
            recorded != Some(instance.uuid.as_str())
        }
    }
}

/// Runs one reconciliation pass immediately, then every `period`, until the
/// process exits.
pub async fn run(client: Client, provider: Arc<dyn ComputeProvider>, period: Duration, concurrency: usize) -> Result<(), Error> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&client, provider.clone(), concurrency.max(1)).await {
            eprintln!("dangling-instance sweep failed: {e}");
        }
    }
}

async fn sweep_once(client: &Client, provider: Arc<dyn ComputeProvider>, concurrency: usize) -> Result<(), Error> {
    let api: Api<Sandbox> = Api::all(client.clone());
    let list = api.list(&ListParams::default()).await?;
    let sandboxes: HashMap<(String, String), Sandbox> = list
        .into_iter()
        .map(|s| ((s.namespace().unwrap_or_default(), s.name_any()), s))
        .collect();

    let instances = provider.list_paused_instances().await?;
    let marked: Vec<PausedInstance> = instances.into_iter().filter(|i| should_delete_instance(&sandboxes, i)).collect();

    let semaphore = Arc::new(Semaphore::new(concurrency.min(DELETE_CONCURRENCY)));
    let mut handles = Vec::with_capacity(marked.len());
    for instance in marked {
        let semaphore = semaphore.clone();
        let provider = provider.clone();
        let id = instance.id.clone();
        tokio::time::sleep(DELETE_RATE).await;
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            if let Err(e) = provider.delete_instance(&id).await {
                eprintln!("failed to delete dangling instance {id}: {e}");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::provider::PausedInstance;
    use sandbox_types::{PodInfo, SandboxStatus};
    use std::collections::BTreeMap;

    fn instance(ns: &str, name: &str, uuid: &str) -> PausedInstance {
        PausedInstance { id: format!("{ns}/{name}"), namespace: ns.into(), name: name.into(), uuid: uuid.into(), annotations: BTreeMap::new() }
    }

    fn sandbox_with_uid(uid: &str) -> Sandbox {
        let mut s = Sandbox::new("s1", Default::default());
        s.status = Some(SandboxStatus { pod_info: Some(PodInfo { pod_uid: Some(uid.to_string()), ..Default::default() }), ..Default::default() });
        s
    }

    #[test]
    fn missing_sandbox_marks_for_deletion() {
        let sandboxes = HashMap::new();
        assert!(should_delete_instance(&sandboxes, &instance("ns", "s1", "uid-1")));
    }

    #[test]
    fn matching_uid_is_kept() {
        let mut sandboxes = HashMap::new();
        sandboxes.insert(("ns".to_string(), "s1".to_string()), sandbox_with_uid("uid-1"));
        assert!(!should_delete_instance(&sandboxes, &instance("ns", "s1", "uid-1")));
    }

    #[test]
    fn mismatched_uid_is_a_duplicate_leak() {
        let mut sandboxes = HashMap::new();
        sandboxes.insert(("ns".to_string(), "s1".to_string()), sandbox_with_uid("uid-old"));
        assert!(should_delete_instance(&sandboxes, &instance("ns", "s1", "uid-new")));
    }
}
