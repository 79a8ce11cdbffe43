use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Sandbox is a long-lived, singleton-per-name workload that can be
/// paused (its pod evicted, state retained) and resumed (a new pod created
/// under the same identity).
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "sandbox.agent.io",
    version = "v1",
    kind = "Sandbox",
    plural = "sandboxes",
    derive = "PartialEq",
    status = "SandboxStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.nodeName\", \"name\": \"NODE\", \"type\": \"string\" }")]
pub struct SandboxSpec {
    /// The pod template this Sandbox converges its owned pod toward.
    pub template: Option<PodTemplateSpec>,

    /// Pause intent. Setting this to `true` evicts the owned pod while
    /// retaining the Sandbox's identity and status; setting it back to
    /// `false` creates a fresh pod under the same name.
    #[serde(default)]
    pub paused: bool,

    /// If set and in the past, `paused` is forced to `true` on the next
    /// reconcile.
    pub pause_time: Option<Time>,

    /// If set and in the past, the Sandbox is deleted on the next
    /// reconcile.
    pub shutdown_time: Option<Time>,

    /// Persistent-volume-claim templates, ensured (but not recreated on
    /// pause) alongside the owned pod.
    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Running,
    Paused,
    Resuming,
    Terminating,
    Succeeded,
    Failed,
}

impl SandboxPhase {
    /// `Succeeded` and `Failed` are absorbing: once entered, no further
    /// transitions and no reconciliation work is performed.
    pub fn is_absorbing(self) -> bool {
        matches!(self, SandboxPhase::Succeeded | SandboxPhase::Failed)
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Running => "Running",
            SandboxPhase::Paused => "Paused",
            SandboxPhase::Resuming => "Resuming",
            SandboxPhase::Terminating => "Terminating",
            SandboxPhase::Succeeded => "Succeeded",
            SandboxPhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of the owned pod's identity, cached on the Sandbox at the
/// last observation so it survives the pod's own deletion during a pause.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct PodInfo {
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub pod_uid: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    pub observed_generation: Option<i64>,
    pub update_revision: Option<String>,
    pub message: Option<String>,
    pub pod_info: Option<PodInfo>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub node_name: Option<String>,
    #[serde(rename = "sandboxIp")]
    pub sandbox_ip: Option<String>,
}

/// Named condition types recognised on `Sandbox.status.conditions`.
pub mod condition_type {
    pub const READY: &str = "Ready";
    pub const PAUSED: &str = "Paused";
    pub const RESUMED: &str = "Resumed";
    pub const INPLACE_UPDATE: &str = "InplaceUpdate";
}

/// Well-known condition reasons used by the phase handlers.
pub mod reason {
    pub const POD_READY: &str = "PodReady";
    pub const DELETE_POD: &str = "DeletePod";
    pub const CREATE_POD: &str = "CreatePod";
    pub const INPLACE_UPDATING: &str = "InplaceUpdating";
    pub const INPLACE_SUCCEEDED: &str = "Succeeded";
    pub const START_CONTAINER_FAILED: &str = "StartContainerFailed";
}
