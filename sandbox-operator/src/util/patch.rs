use std::fmt::Debug;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use sandbox_types::{Sandbox, SandboxStatus};
use serde::{Serialize, de::DeserializeOwned};

use super::MANAGER_NAME;

pub trait Object<S> {
    fn mut_status(&mut self) -> &mut S;
}

impl Object<SandboxStatus> for Sandbox {
    fn mut_status(&mut self) -> &mut SandboxStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Applies `f` to a clone of `instance`'s status and issues the resulting
/// JSON merge patch against the status subresource. A no-op `f` produces an
/// empty diff and `kube` skips the round trip.
pub async fn patch_status<S, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
    S: Serialize,
{
    let mut modified = instance.clone();
    f(modified.mut_status());
    let patch = Patch::Json::<T>(json_patch::diff(
        &serde_json::to_value(instance).unwrap(),
        &serde_json::to_value(&modified).unwrap(),
    ));
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

pub fn now() -> Time {
    Time::from(Timestamp::now())
}

/// Adds `finalizer` to a Sandbox's metadata if not already present, returning
/// the patched object so callers see the new resource version without a
/// second round trip. No-op (returns a clone) if already present.
pub async fn add_finalizer(client: Client, sandbox: &Sandbox, finalizer: &str) -> Result<Sandbox, Error> {
    if sandbox.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == finalizer)) {
        return Ok(sandbox.clone());
    }
    let mut finalizers = sandbox.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    let name = sandbox.meta().name.as_deref().unwrap();
    let namespace = sandbox.meta().namespace.as_deref().unwrap();
    let api: Api<Sandbox> = Api::namespaced(client, namespace);
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch)).await
}

/// Removes `finalizer` from a Sandbox's metadata if present. No-op if absent.
pub async fn remove_finalizer(client: Client, sandbox: &Sandbox, finalizer: &str) -> Result<Sandbox, Error> {
    let Some(existing) = sandbox.metadata.finalizers.as_ref() else {
        return Ok(sandbox.clone());
    };
    if !existing.iter().any(|x| x == finalizer) {
        return Ok(sandbox.clone());
    }
    let finalizers: Vec<String> = existing.iter().filter(|x| x.as_str() != finalizer).cloned().collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    let name = sandbox.meta().name.as_deref().unwrap();
    let namespace = sandbox.meta().namespace.as_deref().unwrap();
    let api: Api<Sandbox> = Api::namespaced(client, namespace);
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch)).await
}
