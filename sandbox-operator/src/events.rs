use k8s_openapi::api::core::v1::Pod;

use sandbox_common::{annotations, labels};

/// Condition types the Sandbox-created pod filter treats as relevant to an
/// "active" change, compared by (Status, Reason, Message).
const TRACKED_CONDITIONS: &[&str] = &["Ready", "ContainersPaused", "ContainersResumed"];

/// Sandbox-created pod filter: only pods this controller created are
/// relevant to the Sandbox reconciler.
pub fn is_sandbox_created_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::CREATED_BY))
        .is_some_and(|v| !v.is_empty())
}

/// Whether an update between `old` and `new` (both sandbox-created pods)
/// constitutes an "active" change worth reconciling on: phase or IP changed,
/// a tracked condition changed, or any container status element differs.
pub fn sandbox_pod_active_change(old: &Pod, new: &Pod) -> bool {
    let old_status = old.status.as_ref();
    let new_status = new.status.as_ref();

    let phase_changed = old_status.and_then(|s| s.phase.as_deref())
        != new_status.and_then(|s| s.phase.as_deref());
    let ip_changed =
        old_status.and_then(|s| s.pod_ip.as_deref()) != new_status.and_then(|s| s.pod_ip.as_deref());

    let conditions_changed = TRACKED_CONDITIONS.iter().any(|type_| {
        let old_c = find_condition(old_status, type_);
        let new_c = find_condition(new_status, type_);
        match (old_c, new_c) {
            (None, None) => false,
            (Some(_), None) | (None, Some(_)) => true,
            (Some(a), Some(b)) => a.status != b.status || a.reason != b.reason || a.message != b.message,
        }
    });

    let container_statuses_changed = old_status.and_then(|s| s.container_statuses.as_ref())
        != new_status.and_then(|s| s.container_statuses.as_ref());

    phase_changed || ip_changed || conditions_changed || container_statuses_changed
}

fn find_condition<'a>(
    status: Option<&'a k8s_openapi::api::core::v1::PodStatus>,
    type_: &str,
) -> Option<&'a k8s_openapi::api::core::v1::PodCondition> {
    status?.conditions.as_ref()?.iter().find(|c| c.type_ == type_)
}

/// §4.6 eligibility: a pod the bypass reconciler should translate into a
/// co-named Sandbox.
pub fn is_bypass_eligible(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let enable_paused = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::ENABLE_PAUSED))
        .is_some_and(|v| v == "true");
    if !enable_paused {
        return false;
    }
    let auto_create = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::ENABLE_AUTO_CREATE_SANDBOX))
        .is_some_and(|v| v == "true");
    if !auto_create {
        return false;
    }
    let mid_protocol = find_condition(pod.status.as_ref(), "ContainersPaused").is_some()
        || find_condition(pod.status.as_ref(), "ContainersResumed").is_some();
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    mid_protocol || !matches!(phase, Some("Succeeded") | Some("Failed"))
}

/// Bypass pod filter's update trigger: the pause-intent annotation changed.
pub fn bypass_pod_transition_edge(old: &Pod, new: &Pod) -> bool {
    let get = |p: &Pod| p.metadata.annotations.as_ref().and_then(|a| a.get(annotations::SANDBOX_PAUSE)).cloned();
    get(old) != get(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_annotations(pairs: &[(&str, &str)]) -> Pod {
        let mut annotations = BTreeMap::new();
        for (k, v) in pairs {
            annotations.insert(k.to_string(), v.to_string());
        }
        Pod { metadata: ObjectMeta { annotations: Some(annotations), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn sandbox_created_filter_requires_nonempty_annotation() {
        assert!(!is_sandbox_created_pod(&Pod::default()));
        assert!(!is_sandbox_created_pod(&pod_with_annotations(&[(annotations::CREATED_BY, "")])));
        assert!(is_sandbox_created_pod(&pod_with_annotations(&[(annotations::CREATED_BY, "sandbox")])));
    }

    fn pod_with_phase(phase: &str) -> Pod {
        Pod { status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }), ..Default::default() }
    }

    #[test]
    fn active_change_detects_phase_transition() {
        let old = pod_with_phase("Pending");
        let new = pod_with_phase("Running");
        assert!(sandbox_pod_active_change(&old, &new));
    }

    #[test]
    fn active_change_is_false_for_identical_pods() {
        let pod = pod_with_phase("Running");
        assert!(!sandbox_pod_active_change(&pod, &pod));
    }

    #[test]
    fn active_change_detects_tracked_condition_change() {
        let mut old = pod_with_phase("Running");
        old.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".into(), status: "False".into(), ..Default::default()
        }]);
        let mut new = old.clone();
        new.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status = "True".into();
        assert!(sandbox_pod_active_change(&old, &new));
    }

    #[test]
    fn active_change_ignores_untracked_condition() {
        let mut old = pod_with_phase("Running");
        old.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "PodScheduled".into(), status: "True".into(), ..Default::default()
        }]);
        let mut new = old.clone();
        new.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].message = Some("rescheduled".into());
        assert!(!sandbox_pod_active_change(&old, &new));
    }

    fn eligible_pod() -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(labels::ENABLE_AUTO_CREATE_SANDBOX.to_string(), "true".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::ENABLE_PAUSED.to_string(), "true".to_string());
        Pod {
            metadata: ObjectMeta { labels: Some(labels), annotations: Some(annotations), ..Default::default() },
            status: Some(PodStatus { phase: Some("Running".to_string()), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn bypass_eligibility_requires_both_annotation_and_label() {
        assert!(is_bypass_eligible(&eligible_pod()));

        let mut missing_label = eligible_pod();
        missing_label.metadata.labels = None;
        assert!(!is_bypass_eligible(&missing_label));
    }

    #[test]
    fn bypass_eligibility_excludes_terminal_phases_unless_mid_protocol() {
        let mut pod = eligible_pod();
        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert!(!is_bypass_eligible(&pod));

        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "ContainersPaused".into(), status: "True".into(), ..Default::default()
        }]);
        assert!(is_bypass_eligible(&pod), "mid-protocol pods remain eligible even when terminal");
    }

    #[test]
    fn bypass_eligibility_excludes_deleting_pods() {
        let mut pod = eligible_pod();
        pod.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::jiff::Timestamp::now(),
        ));
        assert!(!is_bypass_eligible(&pod));
    }

    #[test]
    fn transition_edge_detects_pause_annotation_change() {
        let old = pod_with_annotations(&[(annotations::SANDBOX_PAUSE, "false")]);
        let new = pod_with_annotations(&[(annotations::SANDBOX_PAUSE, "true")]);
        assert!(bypass_pod_transition_edge(&old, &new));
        assert!(!bypass_pod_transition_edge(&old, &old));
    }
}
