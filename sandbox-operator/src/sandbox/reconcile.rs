use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::jiff::Timestamp;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use sandbox_common::annotations;
use sandbox_types::{Sandbox, SandboxPhase, SandboxStatus, condition_type, reason};
use tokio_util::sync::CancellationToken;

use super::handlers;
use crate::conditions;
use crate::events;
use crate::expectations::{Expectations, ObjectKey};
use crate::hash;
use crate::util::{
    self, EXPECTATION_TIMEOUT, Error, FINALIZER, PROBE_INTERVAL,
    colors::{FG1, FG2},
    patch::now,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `Sandbox` controller.
pub async fn run(client: Client, workers: u16) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Sandbox controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));
    let lease_namespace = crate::config::pod_namespace();
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandbox-operator-{}", uuid::Uuid::new_v4()));

    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "sandbox-operator-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        sandbox_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    sandbox_common::signal_ready();

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted sandbox controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting sandbox controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<Sandbox> = Api::namespaced(client_for_controller.clone(), &controller_namespace);
                let worker_count = usize::from(workers.max(1));
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Sandbox controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(Api::<Pod>::namespaced(client_for_controller, &controller_namespace), Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each_concurrent(worker_count, |_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping sandbox controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
    expectations: Expectations,
    /// Last sandbox-created pod observed per Sandbox, used to tell a
    /// relevant pod update from a no-op resync (§4.7 Module G).
    pod_cache: Mutex<HashMap<ObjectKey, Pod>>,
}

impl ContextData {
    fn new(client: Client) -> Self {
        ContextData {
            client,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("sandbox"),
            expectations: Expectations::new(),
            pod_cache: Mutex::new(HashMap::new()),
        }
    }
}

async fn reconcile(instance: Arc<Sandbox>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("Sandbox resource must be namespaced".to_string()))?;
    let name = instance.name_any();
    let key = ObjectKey::new(namespace.clone(), name.clone());

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    let start = Instant::now();

    // Observe this reconcile's own trigger, so a write-barrier wait set up by
    // an earlier cycle can clear as soon as the cache catches up rather than
    // stalling for the full timeout.
    context.expectations.observe(&key, &instance.resource_version().unwrap_or_default());

    // Step 2: template presence gate.
    if instance.spec.template.is_none() {
        eprintln!(
            "{}",
            format!("{namespace}/{name}: no pod template set, skipping").color(FG1)
        );
        return Ok(Action::await_change());
    }

    // Step 3: write-barrier gate.
    let (satisfied, elapsed) = context.expectations.is_satisfied(&key);
    if !satisfied {
        if elapsed < EXPECTATION_TIMEOUT {
            return Ok(Action::requeue(EXPECTATION_TIMEOUT - elapsed));
        }
        context.expectations.delete(&key);
    }

    // Step 4: PVC ensure.
    handlers::ensure_pvcs(&client, &namespace, &instance).await?;

    // Step 5: fetch pod. A pod this controller didn't create (e.g. the
    // externally-owned pod behind a bypass Sandbox sharing this name) is not
    // this Sandbox's pod (§4.7 Module G).
    let pod = get_pod(client.clone(), &namespace, &name).await?.filter(events::is_sandbox_created_pod);

    let mut instance = (*instance).clone();
    let observed_status = instance.status.clone().unwrap_or_default();
    let mut new_status = observed_status.clone();

    // Step 5b: relevance filter (§4.7 Module G). Once the Sandbox has
    // converged (Running, finalizer set, no spec change, no time trigger
    // due), a pod update that touched nothing this reconciler tracks is a
    // no-op resync; skip straight to the next probe instead of recomputing
    // and repatching status.
    let previous_pod = {
        let mut cache = context.pod_cache.lock().unwrap();
        match &pod {
            Some(p) => cache.insert(key.clone(), p.clone()),
            None => cache.remove(&key),
        }
    };
    if let (Some(prev), Some(cur)) = (&previous_pod, &pod) {
        let converged = instance.metadata.deletion_timestamp.is_none()
            && observed_status.phase == SandboxPhase::Running
            && instance.metadata.generation == observed_status.observed_generation
            && instance.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == FINALIZER))
            && instance.spec.shutdown_time.is_none()
            && instance.spec.pause_time.is_none();
        if converged && !events::sandbox_pod_active_change(prev, cur) {
            return Ok(Action::requeue(PROBE_INTERVAL));
        }
    }

    // Step 6: terminating branch.
    if instance.metadata.deletion_timestamp.is_some() {
        new_status.phase = SandboxPhase::Terminating;
        if conditions::get_condition(&new_status.conditions, condition_type::READY).is_some_and(|c| c.status == "True") {
            conditions::set_condition(&mut new_status.conditions, condition_type::READY, "False", "Terminating", "sandbox deleting", now());
        }
        handlers::ensure_terminated(&client, &namespace, &instance, pod.as_ref()).await?;
        patch_if_changed(&client, &context, &key, &instance, &observed_status, &new_status).await?;
        log_reconcile(&namespace, &name, "Terminating");
        return Ok(Action::await_change());
    }

    // Step 7: absorbing check.
    if observed_status.phase.is_absorbing() {
        return Ok(Action::await_change());
    }

    // Step 8: finalizer ensure.
    if !instance.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == FINALIZER)) {
        instance = util::patch::add_finalizer(client.clone(), &instance, FINALIZER).await?;
        context.expectations.expect(key.clone(), instance.resource_version().unwrap_or_default());
    }

    // Step 9: time triggers.
    let mut requeue_after: Option<Duration> = None;
    if let Some(shutdown_time) = &instance.spec.shutdown_time {
        let remaining = shutdown_time.0.duration_since(Timestamp::now());
        if remaining.is_zero() || remaining.is_negative() {
            let api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
            api.delete(&name, &Default::default()).await?;
            return Ok(Action::await_change());
        }
        requeue_after = Some(remaining.try_into().unwrap_or(PROBE_INTERVAL));
    }
    if let Some(pause_time) = &instance.spec.pause_time
        && !instance.spec.paused
    {
        let remaining = pause_time.0.duration_since(Timestamp::now());
        if remaining.is_zero() || remaining.is_negative() {
            let patch = serde_json::json!({ "spec": { "paused": true } });
            let api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
            instance = api
                .patch(&name, &kube::api::PatchParams::apply(util::MANAGER_NAME), &kube::api::Patch::Merge(patch))
                .await?;
        } else {
            let remaining: Duration = remaining.try_into().unwrap_or(PROBE_INTERVAL);
            requeue_after = Some(requeue_after.map_or(remaining, |r| r.min(remaining)));
        }
    }

    // Step 10: status calculation.
    let (mut calculated, should_requeue) = calculate_status(&instance, pod.as_ref(), &observed_status);
    if should_requeue {
        patch_if_changed(&client, &context, &key, &instance, &observed_status, &calculated).await?;
        log_reconcile(&namespace, &name, "Requeue");
        return Ok(Action::requeue(requeue_after.unwrap_or(Duration::from_secs(2))));
    }

    // Step 11: dispatch.
    let phase = calculated.phase;
    log_reconcile(&namespace, &name, phase.to_string().as_str());
    #[cfg(feature = "metrics")]
    context.metrics.action_counter.with_label_values(&[&name, &namespace, phase.to_string().as_str()]).inc();

    let outcome = match phase {
        SandboxPhase::Pending => {
            instance = ensure_structural_hash_annotation(client.clone(), &instance).await?;
            handlers::ensure_running(&client, &namespace, &instance, pod.as_ref(), &mut calculated).await?
        }
        SandboxPhase::Running => handlers::ensure_updated(&client, &namespace, &instance, pod.as_ref(), &mut calculated).await?,
        SandboxPhase::Paused => handlers::ensure_paused(&client, &namespace, pod.as_ref(), &mut calculated).await?,
        SandboxPhase::Resuming => handlers::ensure_resumed(&client, &namespace, &instance, pod.as_ref(), &mut calculated).await?,
        SandboxPhase::Terminating | SandboxPhase::Succeeded | SandboxPhase::Failed => handlers::HandlerOutcome::none(),
    };

    // Step 12: patch status iff changed.
    patch_if_changed(&client, &context, &key, &instance, &observed_status, &calculated).await?;

    #[cfg(feature = "metrics")]
    context.metrics.read_histogram.with_label_values(&[&name, &namespace, phase.to_string().as_str()]).observe(start.elapsed().as_secs_f64());

    // Step 13: requeue carrying any time-trigger deadline or handler preference.
    let final_requeue = outcome.requeue_after.or(requeue_after).unwrap_or(PROBE_INTERVAL);
    Ok(Action::requeue(final_requeue))
}

async fn patch_if_changed(
    client: &Client,
    context: &ContextData,
    key: &ObjectKey,
    instance: &Sandbox,
    observed: &SandboxStatus,
    new_status: &SandboxStatus,
) -> Result<(), Error> {
    if new_status == observed {
        return Ok(());
    }
    let new_status = new_status.clone();
    let patched = util::patch::patch_status(client.clone(), instance, move |s: &mut SandboxStatus| {
        *s = new_status;
    })
    .await?;
    context.expectations.expect(key.clone(), patched.resource_version().unwrap_or_default());
    Ok(())
}

fn log_reconcile(namespace: &str, name: &str, action: &str) {
    println!(
        "🔧 {}{}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " PHASE: ".color(FG1),
        action.color(FG2),
    );
}

async fn ensure_structural_hash_annotation(client: Client, sandbox: &Sandbox) -> Result<Sandbox, Error> {
    if sandbox.annotations().contains_key(annotations::STRUCTURAL_HASH) {
        return Ok(sandbox.clone());
    }
    let Some(template) = &sandbox.spec.template else {
        return Ok(sandbox.clone());
    };
    let structural = hash::hash_structural(&serde_json::to_value(template)?);
    let patch = serde_json::json!({ "metadata": { "annotations": { annotations::STRUCTURAL_HASH: structural } } });
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();
    let api: Api<Sandbox> = Api::namespaced(client, &namespace);
    api.patch(&name, &kube::api::PatchParams::apply(util::MANAGER_NAME), &kube::api::Patch::Merge(patch))
        .await
        .map_err(Error::from)
}

async fn get_pod(client: Client, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pure status-calculation step (§4.5), independent of any I/O. Returns the
/// computed status and whether the caller should patch and requeue
/// immediately without dispatching to a phase handler this cycle.
fn calculate_status(sandbox: &Sandbox, pod: Option<&Pod>, prior: &SandboxStatus) -> (SandboxStatus, bool) {
    let mut status = prior.clone();
    let template = sandbox.spec.template.as_ref();
    if let Some(template) = template
        && let Ok(value) = serde_json::to_value(template)
    {
        status.update_revision = Some(hash::hash_full(&value));
    }
    status.observed_generation = sandbox.metadata.generation;

    if let Some(pod) = pod {
        if pod.metadata.deletion_timestamp.is_some() {
            return (status, true);
        }
        let pod_phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if pod_phase == Some("Succeeded") && !sandbox.spec.paused {
            status.phase = SandboxPhase::Succeeded;
            return (status, true);
        }
        if pod_phase == Some("Failed") && !sandbox.spec.paused {
            status.phase = SandboxPhase::Failed;
            return (status, true);
        }
    }

    if sandbox.spec.paused && status.phase == SandboxPhase::Running {
        conditions::remove_condition(&mut status.conditions, condition_type::RESUMED);
        status.phase = SandboxPhase::Paused;
    } else if !sandbox.spec.paused && status.phase == SandboxPhase::Paused {
        conditions::remove_condition(&mut status.conditions, condition_type::PAUSED);
        status.phase = SandboxPhase::Resuming;
        conditions::set_condition(&mut status.conditions, condition_type::RESUMED, "False", reason::CREATE_POD, "resuming sandbox", now());
    }

    (status, false)
}

fn on_error(instance: Arc<Sandbox>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Sandbox reconciliation error for {}: {:?}", instance.name_any(), error).red());
    if error.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, PodTemplateSpec};
    use kube::api::ObjectMeta;
    use sandbox_types::SandboxSpec;

    fn sandbox(paused: bool, phase: SandboxPhase) -> Sandbox {
        let mut s = Sandbox::new(
            "s1",
            SandboxSpec {
                template: Some(PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "main".into(), image: Some("nginx:1.19".into()), ..Default::default() }],
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                paused,
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("default".to_string());
        s.metadata.generation = Some(3);
        s.status = Some(SandboxStatus { phase, ..Default::default() });
        s
    }

    fn running_pod(phase: &str) -> Pod {
        Pod { status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }), ..Default::default() }
    }

    #[test]
    fn sets_observed_generation_and_revision() {
        let sandbox = sandbox(false, SandboxPhase::Pending);
        let (status, requeue) = calculate_status(&sandbox, None, &SandboxStatus::default());
        assert!(!requeue);
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.update_revision.is_some());
    }

    #[test]
    fn terminal_pod_phase_promotes_sandbox_unless_paused() {
        let sandbox = sandbox(false, SandboxPhase::Running);
        let pod = running_pod("Succeeded");
        let (status, requeue) = calculate_status(&sandbox, Some(&pod), &SandboxStatus { phase: SandboxPhase::Running, ..Default::default() });
        assert!(requeue);
        assert_eq!(status.phase, SandboxPhase::Succeeded);
    }

    #[test]
    fn paused_pod_succession_is_ignored_when_sandbox_paused() {
        let sandbox = sandbox(true, SandboxPhase::Running);
        let pod = running_pod("Succeeded");
        let prior = SandboxStatus { phase: SandboxPhase::Running, ..Default::default() };
        let (status, requeue) = calculate_status(&sandbox, Some(&pod), &prior);
        assert!(!requeue);
        assert_ne!(status.phase, SandboxPhase::Succeeded);
    }

    #[test]
    fn pause_transition_running_to_paused() {
        let sandbox = sandbox(true, SandboxPhase::Running);
        let prior = SandboxStatus { phase: SandboxPhase::Running, ..Default::default() };
        let (status, requeue) = calculate_status(&sandbox, None, &prior);
        assert!(!requeue);
        assert_eq!(status.phase, SandboxPhase::Paused);
    }

    #[test]
    fn resume_transition_paused_to_resuming_sets_condition() {
        let sandbox = sandbox(false, SandboxPhase::Paused);
        let prior = SandboxStatus { phase: SandboxPhase::Paused, ..Default::default() };
        let (status, requeue) = calculate_status(&sandbox, None, &prior);
        assert!(!requeue);
        assert_eq!(status.phase, SandboxPhase::Resuming);
        assert!(conditions::get_condition(&status.conditions, condition_type::RESUMED).is_some());
    }

    #[test]
    fn deleting_pod_forces_requeue_without_phase_change() {
        let sandbox = sandbox(false, SandboxPhase::Running);
        let mut pod = running_pod("Running");
        pod.metadata.deletion_timestamp = Some(now());
        let prior = SandboxStatus { phase: SandboxPhase::Running, ..Default::default() };
        let (status, requeue) = calculate_status(&sandbox, Some(&pod), &prior);
        assert!(requeue);
        assert_eq!(status.phase, SandboxPhase::Running);
    }
}
