use std::time::Duration;

pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Default interval for requeuing a converged, steady-state Sandbox.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Field manager name used on every server-side-apply / merge patch this
/// crate issues.
pub(crate) const MANAGER_NAME: &str = "sandbox-operator";

/// The write-visibility barrier's wait timeout (§4.8): bounds how long a
/// reconcile will short-circuit waiting for its own write to become visible.
pub(crate) const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Finalizer carried by every non-terminal, non-deleting Sandbox.
pub(crate) const FINALIZER: &str = "sandbox.agent.io/finalizer";
