//! # Clone Comparison
//!
//! Clone-mode downstream resources are compared against their source with the
//! fields the API server or the engine own removed, so bookkeeping churn is not
//! mistaken for drift.

use crate::labels::{is_engine_label, LAST_APPLIED_ANNOTATION};
use serde_json::{Map, Value};

const VOLATILE_METADATA: &[&str] = &[
    "managedFields",
    "creationTimestamp",
    "resourceVersion",
    "uid",
    "generation",
    "selfLink",
    "ownerReferences",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "finalizers",
    "generateName",
    "name",
    "namespace",
];

/// Copy of `object` without server-owned fields, identity or engine labels
pub fn strip_non_policy_fields(object: &Value) -> Value {
    let mut stripped = object.clone();
    let Some(root) = stripped.as_object_mut() else {
        return stripped;
    };
    root.remove("status");
    if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
        for field in VOLATILE_METADATA {
            metadata.remove(*field);
        }
        prune(metadata, "annotations", |key| key == LAST_APPLIED_ANNOTATION);
        prune(metadata, "labels", is_engine_label);
    }
    stripped
}

/// Remove matching keys from a string map, dropping the map once empty
fn prune(metadata: &mut Map<String, Value>, field: &str, remove: impl Fn(&str) -> bool) {
    let empty = match metadata.get_mut(field) {
        Some(Value::Object(entries)) => {
            entries.retain(|key, _| !remove(key));
            entries.is_empty()
        }
        Some(Value::Null) => true,
        _ => false,
    };
    if empty {
        metadata.remove(field);
    }
}

/// Source and downstream carry the same content
pub fn in_sync(live: &Value, source: &Value) -> bool {
    strip_non_policy_fields(live) == strip_non_policy_fields(source)
}

/// Turn a source object into the downstream object for `namespace/name`
pub fn retarget(source: &Value, namespace: &str, name: &str) -> Value {
    let mut target = strip_non_policy_fields(source);
    if let Some(root) = target.as_object_mut() {
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("name".to_string(), Value::from(name));
            if !namespace.is_empty() {
                metadata.insert("namespace".to_string(), Value::from(namespace));
            }
        }
    }
    target
}
