use sha2::{Digest, Sha256};
use serde_json::Value;

use crate::util::Error;

/// Full hash: canonical serialisation of the entire pod template, including
/// images and resource requests/limits. Becomes `status.updateRevision` and
/// the pod's template-hash label at creation.
pub fn hash_full(template: &Value) -> String {
    hash_value(&canonicalize(template))
}

/// Structural hash: the same serialisation with every container's `image`
/// and `resources` field zeroed, across both `containers` and
/// `initContainers`. Used to gate in-place update eligibility; a mismatch
/// against the stored value means something other than image/resources
/// changed.
pub fn hash_structural(template: &Value) -> String {
    let mut stripped = template.clone();
    strip_images_and_resources(&mut stripped);
    hash_value(&canonicalize(&stripped))
}

fn strip_images_and_resources(template: &mut Value) {
    let Some(spec) = template.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    for key in ["containers", "initContainers"] {
        let Some(containers) = spec.get_mut(key).and_then(Value::as_array_mut) else {
            continue;
        };
        for container in containers {
            let Some(container) = container.as_object_mut() else {
                continue;
            };
            container.insert("image".to_string(), Value::Null);
            container.insert("resources".to_string(), Value::Null);
        }
    }
}

/// Recursively rebuilds `value` with every object's keys in sorted order, so
/// the hash is independent of the serializer's (or `serde_json`'s feature
/// flags') insertion-order behavior.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn hash_value(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).expect("canonicalized value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// PVC name for a volume-claim template belonging to a Sandbox: `"{template_name}-{sandbox_name}"`.
/// Either input being empty is a logical error, no PVC is created.
pub fn pvc_name(template_name: &str, sandbox_name: &str) -> Result<String, Error> {
    if template_name.is_empty() || sandbox_name.is_empty() {
        return Err(Error::UserInput(format!(
            "pvc name derivation requires non-empty template and sandbox names (template={template_name:?}, sandbox={sandbox_name:?})"
        )));
    }
    Ok(format!("{template_name}-{sandbox_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template_with_image(image: &str) -> Value {
        json!({
            "spec": {
                "containers": [
                    { "name": "main", "image": image, "resources": { "limits": { "cpu": "1" } } }
                ]
            }
        })
    }

    #[test]
    fn full_hash_is_pure() {
        let t = template_with_image("nginx:1.19");
        assert_eq!(hash_full(&t), hash_full(&t));
    }

    #[test]
    fn full_hash_changes_with_image() {
        let a = template_with_image("nginx:1.19");
        let b = template_with_image("nginx:1.20");
        assert_ne!(hash_full(&a), hash_full(&b));
    }

    #[test]
    fn structural_hash_is_invariant_under_image_change() {
        let a = template_with_image("nginx:1.19");
        let b = template_with_image("nginx:1.20");
        assert_eq!(hash_structural(&a), hash_structural(&b));
    }

    #[test]
    fn structural_hash_changes_on_volume_addition() {
        let a = template_with_image("nginx:1.19");
        let mut b = a.clone();
        b["spec"]["volumes"] = json!([{ "name": "data" }]);
        assert_ne!(hash_structural(&a), hash_structural(&b));
    }

    #[test]
    fn canonicalization_is_order_independent() {
        let a = json!({ "b": 1, "a": 2 });
        let b = json!({ "a": 2, "b": 1 });
        assert_eq!(hash_value(&canonicalize(&a)), hash_value(&canonicalize(&b)));
    }

    #[test]
    fn pvc_name_rejects_empty_inputs() {
        assert!(pvc_name("", "s1").is_err());
        assert!(pvc_name("data", "").is_err());
        assert_eq!(pvc_name("data", "s1").unwrap(), "data-s1");
    }
}
