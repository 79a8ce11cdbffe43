use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use sandbox_types::Sandbox;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::util::Error;

/// State annotation persisted on the pod (`sandbox.agent.io/inplace-update-state`)
/// for the duration of an in-flight in-place update.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct InplaceUpdateState {
    pub revision: String,
    pub update_timestamp: String,
    pub last_container_statuses: BTreeMap<String, ContainerImageState>,
    pub update_images: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerImageState {
    pub image_id: String,
}

/// Reads and parses the pod's in-place update state annotation, if any.
pub fn read_state(pod: &Pod) -> Option<InplaceUpdateState> {
    let raw = pod.metadata.annotations.as_ref()?.get(sandbox_common::annotations::INPLACE_UPDATE_STATE)?;
    serde_json::from_str(raw).ok()
}

/// Whether an in-flight update (if any) has completed: every container
/// recorded in the state's `lastContainerStatuses` now reports a different
/// `imageID` than what was recorded when the patch was issued. A container
/// that has disappeared from the pod's status is treated as still in flight.
/// Absence of the state annotation means nothing is in flight, vacuously complete.
pub fn is_complete(pod: &Pod) -> bool {
    let Some(state) = read_state(pod) else {
        return true;
    };
    let current = container_image_ids(pod);
    state.last_container_statuses.iter().all(|(name, recorded)| {
        current
            .get(name)
            .is_some_and(|current_id| current_id != &recorded.image_id)
    })
}

/// Builds the single strategic-merge patch document that atomically sets the
/// state annotation, the template-hash label, and the differing container
/// images. Returns `Ok(None)` if the pod's images already match the Sandbox
/// template (nothing to do). Fails if a pod container has no counterpart in
/// the template, a misconfiguration that must not be retried.
pub fn build_patch(sandbox: &Sandbox, pod: &Pod, target_revision: &str, now: Time) -> Result<Option<Value>, Error> {
    let desired = desired_images(sandbox);
    let current = container_image_ids(pod);
    let mut changed_images = Vec::new();
    let mut last_container_statuses = BTreeMap::new();

    for container in pod_containers(pod) {
        let desired_image = desired.get(&container.name).ok_or_else(|| {
            Error::UserInput(format!(
                "pod container '{}' not found in sandbox template",
                container.name
            ))
        })?;
        let current_image = container.image.as_deref().unwrap_or_default();
        if current_image != desired_image {
            changed_images.push(json!({ "name": container.name, "image": desired_image }));
            if let Some(image_id) = current.get(&container.name) {
                last_container_statuses.insert(
                    container.name.clone(),
                    ContainerImageState { image_id: image_id.clone() },
                );
            }
        }
    }

    if changed_images.is_empty() {
        return Ok(None);
    }

    let state = InplaceUpdateState {
        revision: target_revision.to_string(),
        update_timestamp: now.0.to_string(),
        last_container_statuses,
        update_images: true,
    };

    Ok(Some(json!({
        "metadata": {
            "annotations": {
                sandbox_common::annotations::INPLACE_UPDATE_STATE: serde_json::to_string(&state)?,
            },
            "labels": {
                sandbox_common::labels::TEMPLATE_HASH: target_revision,
            },
        },
        "spec": {
            "containers": changed_images,
        },
    })))
}

fn desired_images(sandbox: &Sandbox) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(template) = &sandbox.spec.template
        && let Some(spec) = &template.spec
    {
        for c in &spec.containers {
            if let Some(image) = &c.image {
                map.insert(c.name.clone(), image.clone());
            }
        }
    }
    map
}

fn pod_containers(pod: &Pod) -> &[k8s_openapi::api::core::v1::Container] {
    pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[])
}

fn container_image_ids(pod: &Pod) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            map.insert(cs.name.clone(), cs.image_id.clone());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStateRunning, ContainerStatus, PodSpec, PodStatus, PodTemplateSpec};
    use k8s_openapi::jiff::Timestamp;
    use kube::api::ObjectMeta;
    use sandbox_types::SandboxSpec;

    fn sandbox_with_image(image: &str) -> Sandbox {
        Sandbox::new(
            "s1",
            SandboxSpec {
                template: Some(PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "main".into(), image: Some(image.into()), ..Default::default() }],
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    fn pod_with(image: &str, image_id: &str) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: Some(PodSpec {
                containers: vec![Container { name: "main".into(), image: Some(image.into()), ..Default::default() }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".into(),
                    image: image.into(),
                    image_id: image_id.into(),
                    ready: true,
                    restart_count: 0,
                    state: Some(ContainerState { running: Some(ContainerStateRunning { started_at: None }), ..Default::default() }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn now() -> Time {
        Time::from(Timestamp::now())
    }

    #[test]
    fn no_patch_when_images_match() {
        let sandbox = sandbox_with_image("nginx:1.19");
        let pod = pod_with("nginx:1.19", "sha256:aaa");
        assert!(build_patch(&sandbox, &pod, "rev1", now()).unwrap().is_none());
    }

    #[test]
    fn patch_built_when_image_differs() {
        let sandbox = sandbox_with_image("nginx:1.20");
        let pod = pod_with("nginx:1.19", "sha256:aaa");
        let patch = build_patch(&sandbox, &pod, "rev2", now()).unwrap().unwrap();
        assert_eq!(patch["spec"]["containers"][0]["image"], "nginx:1.20");
        assert_eq!(patch["metadata"]["labels"][sandbox_common::labels::TEMPLATE_HASH], "rev2");
    }

    #[test]
    fn errors_when_pod_container_missing_from_template() {
        let sandbox = sandbox_with_image("nginx:1.19");
        let mut pod = pod_with("nginx:1.19", "sha256:aaa");
        pod.spec.as_mut().unwrap().containers.push(Container { name: "sidecar".into(), image: Some("busybox".into()), ..Default::default() });
        assert!(build_patch(&sandbox, &pod, "rev1", now()).is_err());
    }

    #[test]
    fn completion_requires_image_id_to_change() {
        let mut pod = pod_with("nginx:1.20", "sha256:aaa");
        let mut last = BTreeMap::new();
        last.insert("main".to_string(), ContainerImageState { image_id: "sha256:aaa".into() });
        let state = InplaceUpdateState { revision: "rev2".into(), update_timestamp: "now".into(), last_container_statuses: last, update_images: true };
        pod.metadata.annotations.get_or_insert_with(Default::default).insert(
            sandbox_common::annotations::INPLACE_UPDATE_STATE.to_string(),
            serde_json::to_string(&state).unwrap(),
        );
        assert!(!is_complete(&pod), "image id unchanged, still in flight");

        pod.status.as_mut().unwrap().container_statuses.as_mut().unwrap()[0].image_id = "sha256:bbb".into();
        assert!(is_complete(&pod));
    }

    #[test]
    fn absence_of_state_annotation_is_vacuously_complete() {
        let pod = pod_with("nginx:1.19", "sha256:aaa");
        assert!(is_complete(&pod));
    }

    #[test]
    fn disappeared_container_is_still_in_flight() {
        let mut pod = pod_with("nginx:1.20", "sha256:aaa");
        let mut last = BTreeMap::new();
        last.insert("gone".to_string(), ContainerImageState { image_id: "sha256:aaa".into() });
        let state = InplaceUpdateState { revision: "rev2".into(), update_timestamp: "now".into(), last_container_statuses: last, update_images: true };
        pod.metadata.annotations.get_or_insert_with(Default::default).insert(
            sandbox_common::annotations::INPLACE_UPDATE_STATE.to_string(),
            serde_json::to_string(&state).unwrap(),
        );
        assert!(!is_complete(&pod));
    }
}
