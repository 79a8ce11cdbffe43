use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use sandbox_common::annotations;
use sandbox_types::Sandbox;

use super::provider::ComputeProvider;
use crate::util::{Error, FINALIZER, patch::remove_finalizer};

struct Context {
    client: Client,
    provider: Arc<dyn ComputeProvider>,
}

/// Single-worker reconciler (§4.9) owning finalizer removal for Sandboxes
/// that opted into external-instance cleanup. Runs alongside the periodic
/// dangling-instance sweep but only acts once a Sandbox has a deletion
/// timestamp and `enable-vk-delete-instance = "true"`.
pub async fn run(client: Client, provider: Arc<dyn ComputeProvider>) -> Result<(), Error> {
    let api: Api<Sandbox> = Api::all(client.clone());
    let context = Arc::new(Context { client, provider });
    Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    Ok(())
}

async fn reconcile(sandbox: Arc<Sandbox>, context: Arc<Context>) -> Result<Action, Error> {
    if sandbox.metadata.deletion_timestamp.is_none() {
        return Ok(Action::await_change());
    }
    let opted_in = sandbox.annotations().get(annotations::ENABLE_VK_DELETE_INSTANCE).is_some_and(|v| v == "true");
    if !opted_in {
        return Ok(Action::await_change());
    }
    if !sandbox.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == FINALIZER)) {
        return Ok(Action::await_change());
    }

    let Some(recorded_id) = sandbox.status.as_ref().and_then(|s| s.pod_info.as_ref()).and_then(|p| p.pod_uid.clone()) else {
        // Nothing was ever recorded as owning an external instance; there is
        // nothing to wait on, so release immediately.
        remove_finalizer(context.client.clone(), &sandbox, FINALIZER).await?;
        return Ok(Action::await_change());
    };

    let deleted = context.provider.delete_instance(&recorded_id).await?;
    if deleted {
        remove_finalizer(context.client.clone(), &sandbox, FINALIZER).await?;
        println!(
            "{}",
            format!("🗑️ released finalizer for {}/{} after external instance deletion", sandbox.namespace().unwrap_or_default(), sandbox.name_any())
                .green()
        );
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(10)))
    }
}

fn on_error(sandbox: Arc<Sandbox>, error: &Error, _context: Arc<Context>) -> Action {
    eprintln!("{}", format!("finalizer-release error for {}: {error}", sandbox.name_any()).red());
    Action::requeue(Duration::from_secs(if error.is_transient() { 5 } else { 30 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::{PodInfo, SandboxStatus};

    fn sandbox_with(opted_in: bool, recorded_id: Option<&str>) -> Sandbox {
        let mut s = Sandbox::new("s1", Default::default());
        s.metadata.deletion_timestamp = Some(crate::util::patch::now());
        s.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        if opted_in {
            s.metadata.annotations = Some([(annotations::ENABLE_VK_DELETE_INSTANCE.to_string(), "true".to_string())].into());
        }
        s.status = Some(SandboxStatus {
            pod_info: recorded_id.map(|id| PodInfo { pod_uid: Some(id.to_string()), ..Default::default() }),
            ..Default::default()
        });
        s
    }

    #[test]
    fn non_opted_in_sandbox_is_left_alone() {
        let s = sandbox_with(false, Some("uid-1"));
        assert!(!s.annotations().get(annotations::ENABLE_VK_DELETE_INSTANCE).is_some_and(|v| v == "true"));
    }

    #[test]
    fn opted_in_sandbox_with_no_recorded_instance_has_no_external_wait() {
        let s = sandbox_with(true, None);
        assert!(s.status.unwrap().pod_info.is_none());
    }
}
