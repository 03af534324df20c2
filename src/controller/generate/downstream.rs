//! # Downstream Resources
//!
//! Building, writing, finding and deleting the objects generate rules own.
//! Writes are idempotent: a crash between claim and release re-delivers the UR
//! and every step here tolerates having already happened.

use crate::client::{object_identity, ResourceClient};
use crate::crd::{ResourceSpec, Rule};
use crate::labels::{
    downstream_selector, format_selector, label_value, Labels, DOWNSTREAM_RULE_NAME_LABEL,
};
use crate::observability::metrics;
use crate::{Error, Result};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Object for `target` with `content` as its body and `labels` merged in
pub fn build_object(
    target: &ResourceSpec,
    content: &Value,
    labels: &Labels,
) -> Result<DynamicObject> {
    let Value::Object(mut root) = content.clone() else {
        return Err(Error::Engine(format!(
            "generated content for {target} is not an object"
        )));
    };
    root.insert("apiVersion".to_string(), Value::from(target.api_version.as_str()));
    root.insert("kind".to_string(), Value::from(target.kind.as_str()));

    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return Err(Error::Engine(format!("metadata of {target} is not an object")));
    };
    metadata.insert("name".to_string(), Value::from(target.name.as_str()));
    if target.namespace.is_empty() {
        metadata.remove("namespace");
    } else {
        metadata.insert("namespace".to_string(), Value::from(target.namespace.as_str()));
    }
    let existing = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if !existing.is_object() {
        *existing = Value::Object(Map::new());
    }
    if let Some(existing) = existing.as_object_mut() {
        for (key, value) in labels {
            existing.insert(key.clone(), Value::from(value.as_str()));
        }
    }
    Ok(serde_json::from_value(Value::Object(root))?)
}

/// Every label in `labels` is set on the live object
pub fn has_labels(live: &Value, labels: &Labels) -> bool {
    let Some(actual) = live.pointer("/metadata/labels").and_then(Value::as_object) else {
        return labels.is_empty();
    };
    labels
        .iter()
        .all(|(k, v)| actual.get(k).and_then(Value::as_str) == Some(v.as_str()))
}

/// Create or synchronize one downstream object
///
/// Returns the identity written, or `None` when the object was deliberately not
/// recreated (deleted by a user while synchronize is off).
pub async fn write<F>(
    resources: &dyn ResourceClient,
    desired: DynamicObject,
    synchronize: bool,
    previously_generated: &[ResourceSpec],
    in_sync: F,
) -> Result<Option<ResourceSpec>>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    let target = object_identity(&desired);
    match resources.get(&target).await {
        Err(e) if e.is_not_found() => {
            if !synchronize && previously_generated.iter().any(|r| r.same_object(&target)) {
                debug!(%target, "downstream removed and synchronize is off, not recreating");
                return Ok(None);
            }
            match resources.create(&desired).await {
                Ok(_) => {
                    info!(%target, "✅ created downstream resource");
                    metrics::increment_downstream_writes("create");
                }
                Err(e) if e.is_already_exists() => debug!(%target, "downstream already exists"),
                Err(e) => return Err(e),
            }
            Ok(Some(target))
        }
        Err(e) => Err(e),
        Ok(live) => {
            if !synchronize {
                return Ok(Some(target));
            }
            if in_sync(&serde_json::to_value(&live)?) {
                debug!(%target, "downstream in sync");
                return Ok(Some(target));
            }
            let mut update = desired;
            update.metadata.resource_version.clone_from(&live.metadata.resource_version);
            update.metadata.uid.clone_from(&live.metadata.uid);
            resources.update(&update).await?;
            info!(%target, "🔄 synchronized downstream resource");
            metrics::increment_downstream_writes("update");
            Ok(Some(target))
        }
    }
}

/// `apiVersion/kind` pairs a generate rule can write
fn rule_kinds(rule: &Rule) -> Vec<(String, String)> {
    let Some(generation) = rule.generate.as_ref() else {
        return Vec::new();
    };
    let mut kinds = Vec::new();
    if !generation.kind.is_empty() {
        kinds.push((generation.api_version.clone(), generation.kind.clone()));
    }
    if let Some(list) = &generation.clone_list {
        kinds.extend(
            list.kinds
                .iter()
                .filter_map(|entry| entry.rsplit_once('/'))
                .map(|(api_version, kind)| (api_version.to_string(), kind.to_string())),
        );
    }
    kinds
}

/// Downstream resources labelled as written by `rule`, optionally for one trigger
pub async fn find(
    resources: &dyn ResourceClient,
    policy_key: &str,
    rule: &Rule,
    trigger: Option<&ResourceSpec>,
) -> Result<Vec<ResourceSpec>> {
    let selector = format_selector(&downstream_selector(policy_key, &rule.name, trigger));
    let mut found = Vec::new();
    for (api_version, kind) in rule_kinds(rule) {
        match resources.list(&api_version, &kind, "", Some(&selector)).await {
            Ok(objects) => found.extend(objects.iter().map(object_identity)),
            // kind not served by this cluster
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(found)
}

/// What `rule` generated for `trigger`
///
/// A UR records the downstream of every rule it covers, so recorded resources
/// only count when the live object still carries this rule's name. Recorded
/// resources that no longer exist are left out.
pub async fn rule_targets(
    resources: &dyn ResourceClient,
    policy_key: &str,
    rule: &Rule,
    trigger: Option<&ResourceSpec>,
    recorded: &[ResourceSpec],
) -> Result<Vec<ResourceSpec>> {
    let rule_label = label_value(&rule.name);
    let mut targets = Vec::new();
    for target in recorded {
        match resources.get(target).await {
            Ok(obj) => {
                if obj.labels().get(DOWNSTREAM_RULE_NAME_LABEL) == Some(&rule_label) {
                    targets.push(target.clone());
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    targets.extend(find(resources, policy_key, rule, trigger).await?);
    Ok(targets)
}

/// Delete each target once, tolerating ones already gone; returns what was handled
pub async fn delete_all(
    resources: &dyn ResourceClient,
    targets: &[ResourceSpec],
    reason: &str,
) -> Result<Vec<ResourceSpec>> {
    let mut deleted: Vec<ResourceSpec> = Vec::new();
    for target in targets {
        if deleted.iter().any(|d| d.same_object(target)) {
            continue;
        }
        match resources.delete(target).await {
            Ok(()) => {
                info!(%target, reason, "🗑️ deleted downstream resource");
                metrics::increment_downstream_deletions(reason);
            }
            Err(e) if e.is_not_found() => debug!(%target, "downstream already deleted"),
            Err(e) => return Err(e),
        }
        deleted.push(target.clone());
    }
    Ok(deleted)
}
