use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
    },
};
use owo_colors::OwoColorize;
use sandbox_common::{annotations, events};
use sandbox_types::{Sandbox, SandboxSpec};

use crate::events::{bypass_pod_transition_edge, is_bypass_eligible};
use crate::util::{self, Error, colors::FG1};

struct Context {
    client: Client,
    reporter: Reporter,
    /// Last eligible pod observed per (namespace, name), used to tell a
    /// relevant pause-intent change from a no-op resync (§4.7 Module G).
    pod_cache: Mutex<HashMap<String, Pod>>,
}

/// Entrypoint for the bypass controller (§4.6): watches pods, not Sandboxes,
/// and reconciles a co-named Sandbox whenever an externally-owned pod
/// matches the eligibility criteria.
pub async fn run(client: Client, workers: u16) -> Result<(), Error> {
    println!("{}", "⚙️ Starting bypass controller...".green());
    let api: Api<Pod> = Api::all(client.clone());
    let context = Arc::new(Context {
        client,
        reporter: Reporter::from("sandbox-operator-bypass"),
        pod_cache: Mutex::new(HashMap::new()),
    });
    Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each_concurrent(usize::from(workers.max(1)), |_res| async move {})
        .await;
    Ok(())
}

async fn reconcile(pod: Arc<Pod>, context: Arc<Context>) -> Result<Action, Error> {
    if !is_bypass_eligible(&pod) {
        return Ok(Action::await_change());
    }
    let Some(namespace) = pod.namespace() else {
        return Ok(Action::await_change());
    };
    let name = pod.name_any();
    let client = context.client.clone();

    // Relevance filter: a pod update that changed neither the pause-intent
    // annotation nor the recreate-intent annotation is a no-op resync.
    let cache_key = format!("{namespace}/{name}");
    let previous_pod = context.pod_cache.lock().unwrap().insert(cache_key, (*pod).clone());
    if let Some(prev) = &previous_pod {
        let recreating_changed = prev.annotations().get(annotations::RECREATING) != pod.annotations().get(annotations::RECREATING);
        if !bypass_pod_transition_edge(prev, &pod) && !recreating_changed {
            return Ok(Action::await_change());
        }
    }

    // Step 1: mark the pod as externally owned.
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "metadata": { "annotations": { annotations::CREATED_BY: annotations::CREATED_BY_EXTERNAL } } });
    match pods.patch(&name, &kube::api::PatchParams::apply(util::MANAGER_NAME), &kube::api::Patch::Merge(patch)).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(Action::await_change()),
        Err(e) => return Err(e.into()),
    }

    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
    let pause_intent = pod.annotations().get(annotations::SANDBOX_PAUSE).is_some_and(|v| v == "true");
    let recreating = pod.annotations().get(annotations::RECREATING).is_some_and(|v| v == "true");

    match sandboxes.get_opt(&name).await? {
        None => {
            let mut sandbox = Sandbox::new(&name, SandboxSpec { paused: pause_intent, ..Default::default() });
            sandbox.metadata.annotations = Some(
                [
                    (annotations::DISABLE_POD_CREATION.to_string(), "true".to_string()),
                    (annotations::DISABLE_POD_DELETION.to_string(), "true".to_string()),
                ]
                .into(),
            );
            sandboxes.create(&Default::default(), &sandbox).await?;
            emit(&context, &pod, events::SANDBOX_CREATED, "bypass-managed sandbox created").await;
            println!("{}", format!("{namespace}/{name}: created bypass sandbox (paused={pause_intent})").color(FG1));
        }
        Some(sandbox) => {
            if pause_intent && !sandbox.spec.paused && !recreating {
                patch_paused(&client, &namespace, &name, true).await?;
                emit(&context, &pod, events::SANDBOX_PAUSED, "bypass pause intent observed").await;
            } else if pause_intent && sandbox.spec.paused && recreating {
                patch_paused(&client, &namespace, &name, false).await?;
                emit(&context, &pod, events::SANDBOX_RESUMED, "bypass recreate intent observed").await;
            }
        }
    }

    Ok(Action::await_change())
}

async fn patch_paused(client: &Client, namespace: &str, name: &str, paused: bool) -> Result<(), Error> {
    let api: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "spec": { "paused": paused } });
    api.patch(name, &kube::api::PatchParams::apply(util::MANAGER_NAME), &kube::api::Patch::Merge(patch)).await?;
    Ok(())
}

async fn emit(context: &Context, pod: &Pod, reason: &str, note: &str) {
    let reference = pod.object_ref(&());
    let recorder = Recorder::new(context.client.clone(), context.reporter.clone());
    let event = Event { type_: EventType::Normal, reason: reason.to_string(), note: Some(note.to_string()), action: reason.to_string(), secondary: None };
    if let Err(e) = recorder.publish(&event, &reference).await {
        eprintln!("failed to publish {reason} event: {e}");
    }
}

fn on_error(pod: Arc<Pod>, error: &Error, _context: Arc<Context>) -> Action {
    eprintln!("{}", format!("bypass reconciliation error for {}: {error}", pod.name_any()).red());
    Action::requeue(Duration::from_secs(if error.is_transient() { 5 } else { 30 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    #[test]
    fn pause_intent_is_read_from_pod_annotation() {
        let pod = Pod {
            metadata: ObjectMeta {
                annotations: Some([(annotations::SANDBOX_PAUSE.to_string(), "true".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(pod.annotations().get(annotations::SANDBOX_PAUSE).is_some_and(|v| v == "true"));
        let _ = Time(k8s_openapi::jiff::Timestamp::now());
    }
}
