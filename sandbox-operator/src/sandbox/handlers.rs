use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodSpec, Volume, VolumeResourceRequirements};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt, api::{DeleteParams, ObjectMeta}};
use sandbox_common::{annotations, events, labels};
use sandbox_types::{PodInfo, Sandbox, SandboxPhase, SandboxStatus, condition_type, reason};

use crate::conditions;
use crate::hash;
use crate::inplace;
use crate::util::{Error, patch::now};

/// What a phase handler asks the outer reconciler to do after it returns.
#[derive(Default, Debug, Clone, Copy)]
pub struct HandlerOutcome {
    pub requeue_after: Option<Duration>,
}

impl HandlerOutcome {
    pub fn none() -> Self {
        HandlerOutcome::default()
    }

    pub fn after(d: Duration) -> Self {
        HandlerOutcome { requeue_after: Some(d) }
    }
}

/// §4.4.1, phase Pending.
pub async fn ensure_running(
    client: &Client,
    namespace: &str,
    sandbox: &Sandbox,
    pod: Option<&Pod>,
    status: &mut SandboxStatus,
) -> Result<HandlerOutcome, Error> {
    let Some(pod) = pod else {
        create_pod(client, namespace, sandbox, status).await?;
        return Ok(HandlerOutcome::none());
    };

    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running") {
        status.phase = SandboxPhase::Running;
        mirror_ready_condition(status, pod);
    }

    Ok(HandlerOutcome::none())
}

/// §4.4.2, phase Running. Owns the in-place update interlocks.
pub async fn ensure_updated(
    client: &Client,
    namespace: &str,
    sandbox: &Sandbox,
    pod: Option<&Pod>,
    status: &mut SandboxStatus,
) -> Result<HandlerOutcome, Error> {
    let Some(pod) = pod else {
        status.phase = SandboxPhase::Failed;
        status.message = Some("Sandbox Pod Not Found".to_string());
        return Ok(HandlerOutcome::none());
    };

    update_observed_pod_fields(status, pod);

    let target_revision = status.update_revision.clone().unwrap_or_default();
    let Some(current_revision) = pod.labels().get(labels::TEMPLATE_HASH).cloned() else {
        // No template-hash label: this pod predates in-place update support.
        mirror_ready_condition(status, pod);
        return Ok(HandlerOutcome::none());
    };

    if current_revision == target_revision {
        if inplace::is_complete(pod) {
            conditions::set_condition(
                &mut status.conditions,
                condition_type::INPLACE_UPDATE,
                "True",
                reason::INPLACE_SUCCEEDED,
                "in-place update completed",
                now(),
            );
            mirror_ready_condition(status, pod);
            flag_waiting_containers(status, pod);
        } else {
            mark_inplace_updating(status);
        }
        return Ok(HandlerOutcome::none());
    }

    let stored_structural = sandbox
        .annotations()
        .get(annotations::STRUCTURAL_HASH)
        .cloned()
        .unwrap_or_default();
    let recomputed_structural = match &sandbox.spec.template {
        Some(t) => hash::hash_structural(&serde_json::to_value(t)?),
        None => String::new(),
    };

    if !stored_structural.is_empty() && stored_structural != recomputed_structural {
        // Disallowed mutation: only image/resources may change in place.
        emit_inplace_update_forbidden(client, pod).await;
        return Ok(HandlerOutcome::none());
    }

    if inplace::read_state(pod).is_some() {
        // Serial only: wait for the prior update to finish.
        mark_inplace_updating(status);
        return Ok(HandlerOutcome::after(Duration::from_secs(5)));
    }

    match inplace::build_patch(sandbox, pod, &target_revision, now())? {
        None => mirror_ready_condition(status, pod),
        Some(patch) => {
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            pods.patch(
                &pod.name_any(),
                &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
                &kube::api::Patch::Strategic(patch),
            )
            .await?;
            mark_inplace_updating(status);
        }
    }

    Ok(HandlerOutcome::none())
}

/// Warns on the owning pod that a structural field (anything other than
/// image/resources) changed, so the in-place update was refused (§4.3, §6.5).
async fn emit_inplace_update_forbidden(client: &Client, pod: &Pod) {
    let reference = pod.object_ref(&());
    let recorder = Recorder::new(client.clone(), Reporter::from(crate::util::MANAGER_NAME));
    let event = Event {
        type_: EventType::Warning,
        reason: events::INPLACE_UPDATE_FORBIDDEN.to_string(),
        note: Some("sandbox template changed a field other than image or resources; in-place update refused".to_string()),
        action: events::INPLACE_UPDATE_FORBIDDEN.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &reference).await {
        eprintln!("failed to publish {} event: {e}", events::INPLACE_UPDATE_FORBIDDEN);
    }
}

fn mark_inplace_updating(status: &mut SandboxStatus) {
    conditions::set_condition(
        &mut status.conditions,
        condition_type::READY,
        "False",
        reason::INPLACE_UPDATING,
        "in-place update in progress",
        now(),
    );
}

fn flag_waiting_containers(status: &mut SandboxStatus, pod: &Pod) {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return;
    };
    for cs in statuses {
        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            let message = waiting.message.clone().unwrap_or_else(|| "container waiting".to_string());
            conditions::set_condition(
                &mut status.conditions,
                condition_type::READY,
                "False",
                reason::START_CONTAINER_FAILED,
                &message,
                now(),
            );
            return;
        }
    }
}

/// §4.4.3, phase Paused.
pub async fn ensure_paused(
    client: &Client,
    namespace: &str,
    pod: Option<&Pod>,
    status: &mut SandboxStatus,
) -> Result<HandlerOutcome, Error> {
    if conditions::get_condition(&status.conditions, condition_type::PAUSED).is_none() {
        conditions::set_condition(
            &mut status.conditions,
            condition_type::PAUSED,
            "False",
            reason::DELETE_POD,
            "deleting sandbox pod",
            now(),
        );
    }

    if conditions::get_condition(&status.conditions, condition_type::PAUSED)
        .is_some_and(|c| c.status == "True")
    {
        return Ok(HandlerOutcome::none());
    }

    if conditions::get_condition(&status.conditions, condition_type::READY)
        .is_some_and(|c| c.status == "True")
    {
        conditions::set_condition(&mut status.conditions, condition_type::READY, "False", "Paused", "sandbox paused", now());
    }

    match pod {
        None => {
            conditions::set_condition(
                &mut status.conditions,
                condition_type::PAUSED,
                "True",
                reason::DELETE_POD,
                "sandbox pod deleted",
                now(),
            );
        }
        Some(p) if p.metadata.deletion_timestamp.is_some() => {}
        Some(p) => {
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            let dp = DeleteParams { grace_period_seconds: Some(30), ..Default::default() };
            match pods.delete(&p.name_any(), &dp).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(HandlerOutcome::none())
}

/// §4.4.4, phase Resuming.
pub async fn ensure_resumed(
    client: &Client,
    namespace: &str,
    sandbox: &Sandbox,
    pod: Option<&Pod>,
    status: &mut SandboxStatus,
) -> Result<HandlerOutcome, Error> {
    if let Some(p) = pod
        && p.metadata.deletion_timestamp.is_some()
    {
        return Err(Error::Transient(
            "predecessor pod still terminating; refusing to create resumed pod".to_string(),
        ));
    }

    let Some(pod) = pod else {
        create_pod(client, namespace, sandbox, status).await?;
        conditions::set_condition(
            &mut status.conditions,
            condition_type::RESUMED,
            "True",
            reason::CREATE_POD,
            "resumed sandbox pod created",
            now(),
        );
        return Ok(HandlerOutcome::none());
    };

    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running") {
        status.phase = SandboxPhase::Running;
        mirror_ready_condition(status, pod);
    }

    Ok(HandlerOutcome::none())
}

/// §4.4.5, phase Terminating. When the pod is gone, the finalizer is
/// removed here unless the Sandbox opted into external-instance cleanup
/// (`enable-vk-delete-instance`), in which case the dedicated GC
/// finalizer-release reconciler owns removing it once the provider confirms
/// the instance is gone too.
pub async fn ensure_terminated(
    client: &Client,
    namespace: &str,
    sandbox: &Sandbox,
    pod: Option<&Pod>,
) -> Result<HandlerOutcome, Error> {
    match pod {
        None => {
            let awaits_external_cleanup = sandbox
                .annotations()
                .get(annotations::ENABLE_VK_DELETE_INSTANCE)
                .is_some_and(|v| v == "true");
            if !awaits_external_cleanup {
                crate::util::patch::remove_finalizer(client.clone(), sandbox, crate::util::FINALIZER).await?;
            }
            Ok(HandlerOutcome::none())
        }
        Some(p) if p.metadata.deletion_timestamp.is_some() => Ok(HandlerOutcome::none()),
        Some(p) => {
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            match pods.delete(&p.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            Ok(HandlerOutcome::none())
        }
    }
}

fn mirror_ready_condition(status: &mut SandboxStatus, pod: &Pod) {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"));
    match ready {
        Some(c) => {
            let transition = c.last_transition_time.clone().unwrap_or_else(now);
            conditions::set_condition(
                &mut status.conditions,
                condition_type::READY,
                &c.status,
                c.reason.as_deref().unwrap_or(""),
                c.message.as_deref().unwrap_or(""),
                transition,
            );
        }
        None => {
            if conditions::get_condition(&status.conditions, condition_type::READY).is_none() {
                conditions::set_condition(
                    &mut status.conditions,
                    condition_type::READY,
                    "False",
                    reason::POD_READY,
                    "pod has no Ready condition yet",
                    now(),
                );
            }
        }
    }
}

fn update_observed_pod_fields(status: &mut SandboxStatus, pod: &Pod) {
    status.node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    status.sandbox_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    status.pod_info = Some(PodInfo {
        node_name: status.node_name.clone(),
        pod_ip: status.sandbox_ip.clone(),
        pod_uid: pod.metadata.uid.clone(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    });
}

/// §4.4.6, pod construction from the Sandbox.
pub fn build_pod(sandbox: &Sandbox, status: &SandboxStatus) -> Result<Pod, Error> {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().ok_or_else(|| Error::UserInput("sandbox has no namespace".to_string()))?;
    let template = sandbox
        .spec
        .template
        .as_ref()
        .ok_or_else(|| Error::UserInput("sandbox has no pod template".to_string()))?;

    let mut labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(labels::TEMPLATE_HASH.to_string(), status.update_revision.clone().unwrap_or_default());

    let mut annotations: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    annotations.insert(annotations::CREATED_BY.to_string(), annotations::CREATED_BY_SANDBOX.to_string());

    let mut spec = template.spec.clone().unwrap_or_default();
    for vct in &sandbox.spec.volume_claim_templates {
        let template_name = vct.metadata.name.clone().unwrap_or_default();
        let pvc_name = hash::pvc_name(&template_name, &name)?;
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: template_name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name,
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            owner_references: Some(vec![sandbox.controller_owner_ref(&()).expect("sandbox is namespaced")]),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Ensures a PVC exists for each volume-claim template (§4.5 step 4).
pub async fn ensure_pvcs(client: &Client, namespace: &str, sandbox: &Sandbox) -> Result<(), Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let sandbox_name = sandbox.name_any();
    for vct in &sandbox.spec.volume_claim_templates {
        let template_name = vct.metadata.name.clone().unwrap_or_default();
        let pvc_name = hash::pvc_name(&template_name, &sandbox_name)?;
        match pvcs.get(&pvc_name).await {
            Ok(_) => continue,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_name),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![sandbox.controller_owner_ref(&()).expect("sandbox is namespaced")]),
                ..Default::default()
            },
            spec: Some(vct.spec.clone().unwrap_or_else(|| PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements::default()),
                ..Default::default()
            })),
            ..Default::default()
        };
        match pvcs.create(&Default::default(), &pvc).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn create_pod(client: &Client, namespace: &str, sandbox: &Sandbox, status: &SandboxStatus) -> Result<(), Error> {
    let pod = build_pod(sandbox, status)?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
    use sandbox_types::SandboxSpec;

    fn sandbox() -> Sandbox {
        let mut s = Sandbox::new(
            "s1",
            SandboxSpec {
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(BTreeMap::new()), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "main".into(), image: Some("nginx:latest".into()), ..Default::default() }],
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("default".to_string());
        s
    }

    #[test]
    fn build_pod_sets_identity_and_revision_label() {
        let sandbox = sandbox();
        let mut status = SandboxStatus::default();
        status.update_revision = Some("rev-1".to_string());
        let pod = build_pod(&sandbox, &status).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("s1"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get(labels::TEMPLATE_HASH).map(String::as_str),
            Some("rev-1")
        );
        assert_eq!(
            pod.metadata.annotations.as_ref().unwrap().get(annotations::CREATED_BY).map(String::as_str),
            Some(annotations::CREATED_BY_SANDBOX)
        );
    }

    #[test]
    fn build_pod_fails_without_template() {
        let mut sandbox = sandbox();
        sandbox.spec.template = None;
        let status = SandboxStatus::default();
        assert!(build_pod(&sandbox, &status).is_err());
    }
}
