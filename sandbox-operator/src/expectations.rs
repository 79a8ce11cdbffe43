use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A process-wide write-visibility barrier, keyed by object. After patching
/// an object, the reconciler records the resource version the write
/// produced; subsequent reconciles for the same key short-circuit until
/// either a watch event reports that version (or later) has been observed,
/// or the wait exceeds a caller-supplied timeout.
#[derive(Default)]
pub struct Expectations {
    inner: Mutex<HashMap<ObjectKey, Expectation>>,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey { namespace: namespace.into(), name: name.into() }
    }
}

struct Expectation {
    resource_version: String,
    written_at: Instant,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the resource version produced by a write this process just made.
    pub fn expect(&self, key: ObjectKey, resource_version: String) {
        self.inner.lock().unwrap().insert(
            key,
            Expectation { resource_version, written_at: Instant::now() },
        );
    }

    /// Clears the expectation for `key` if the observed resource version is
    /// at least as new as the one we're waiting on.
    pub fn observe(&self, key: &ObjectKey, resource_version: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(exp) = inner.get(key)
            && resource_version_at_least(resource_version, &exp.resource_version)
        {
            inner.remove(key);
        }
    }

    /// `(true, 0)` if there is no outstanding expectation for `key`;
    /// otherwise `(false, elapsed-since-write)`, the caller decides whether
    /// elapsed has crossed its own timeout.
    pub fn is_satisfied(&self, key: &ObjectKey) -> (bool, Duration) {
        match self.inner.lock().unwrap().get(key) {
            None => (true, Duration::ZERO),
            Some(exp) => (false, exp.written_at.elapsed()),
        }
    }

    pub fn delete(&self, key: &ObjectKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

/// Resource versions are opaque strings but conventionally monotonically
/// increasing decimal integers; fall back to lexical equality if either
/// side fails to parse (never treat an unparseable version as "newer").
fn resource_version_at_least(observed: &str, expected: &str) -> bool {
    match (observed.parse::<u64>(), expected.parse::<u64>()) {
        (Ok(o), Ok(e)) => o >= e,
        _ => observed == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_when_no_expectation_recorded() {
        let store = Expectations::new();
        let key = ObjectKey::new("default", "s1");
        let (satisfied, elapsed) = store.is_satisfied(&key);
        assert!(satisfied);
        assert_eq!(elapsed, Duration::ZERO);
    }

    #[test]
    fn unsatisfied_until_observed_catches_up() {
        let store = Expectations::new();
        let key = ObjectKey::new("default", "s1");
        store.expect(key.clone(), "100".to_string());
        assert!(!store.is_satisfied(&key).0);

        store.observe(&key, "99");
        assert!(!store.is_satisfied(&key).0, "older resource version must not satisfy");

        store.observe(&key, "100");
        assert!(store.is_satisfied(&key).0);
    }

    #[test]
    fn delete_clears_outstanding_expectation() {
        let store = Expectations::new();
        let key = ObjectKey::new("default", "s1");
        store.expect(key.clone(), "5".to_string());
        store.delete(&key);
        assert!(store.is_satisfied(&key).0);
    }

    #[test]
    fn keys_are_independent() {
        let store = Expectations::new();
        let a = ObjectKey::new("default", "a");
        let b = ObjectKey::new("default", "b");
        store.expect(a.clone(), "1".to_string());
        assert!(store.is_satisfied(&b).0);
        assert!(!store.is_satisfied(&a).0);
    }
}
