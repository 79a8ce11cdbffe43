pub mod metrics;
pub mod shutdown;

/// Annotation and label keys recognised on Sandboxes and the pods they own.
///
/// Mirrors the flat `pub mod annotations` constant table the platform's other
/// controllers use, scoped to this controller's own group prefix.
pub mod annotations {
    pub const STRUCTURAL_HASH: &str = "sandbox.agent.io/structural-hash";
    pub const ENABLE_VK_DELETE_INSTANCE: &str = "sandbox.agent.io/enable-vk-delete-instance";
    pub const DISABLE_POD_CREATION: &str = "sandbox.agent.io/disable-pod-creation";
    pub const DISABLE_POD_DELETION: &str = "sandbox.agent.io/disable-pod-deletion";

    pub const CREATED_BY: &str = "sandbox.agent.io/created-by";
    pub const ENABLE_PAUSED: &str = "sandbox.agent.io/enable-paused";
    pub const SANDBOX_PAUSE: &str = "sandbox.agent.io/sandbox-pause";
    pub const RECREATING: &str = "sandbox.agent.io/recreating";
    pub const INPLACE_UPDATE_STATE: &str = "sandbox.agent.io/inplace-update-state";

    pub const CREATED_BY_SANDBOX: &str = "sandbox";
    pub const CREATED_BY_EXTERNAL: &str = "external";
}

pub mod labels {
    pub const ENABLE_AUTO_CREATE_SANDBOX: &str = "sandbox.agent.io/enable-auto-create-sandbox";
    pub const TEMPLATE_HASH: &str = "sandbox.agent.io/template-hash";
}

pub mod events {
    pub const SANDBOX_CREATED: &str = "SandboxCreated";
    pub const SANDBOX_PAUSED: &str = "SandboxPaused";
    pub const SANDBOX_RESUMED: &str = "SandboxResumed";
    pub const INPLACE_UPDATE_FORBIDDEN: &str = "InplaceUpdateForbidden";
}

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("failed to write readiness file");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
