//! # Labels and Annotations
//!
//! Well-known keys shared by the generator, the reconciler, the cleanup
//! controller and the admission path. The dedup label set is the contract that
//! lets every component find "the" UR for a `(type, policy, trigger)` tuple.

use crate::crd::{RequestType, ResourceSpec};
use std::collections::BTreeMap;

pub const MUTATE_POLICY_LABEL: &str = "mutate.updaterequest.kyverno.io/policy-name";
pub const MUTATE_TRIGGER_NAME_LABEL: &str = "mutate.updaterequest.kyverno.io/trigger-name";
pub const MUTATE_TRIGGER_NAMESPACE_LABEL: &str =
    "mutate.updaterequest.kyverno.io/trigger-namespace";
pub const MUTATE_TRIGGER_KIND_LABEL: &str = "mutate.updaterequest.kyverno.io/trigger-kind";
pub const MUTATE_TRIGGER_API_VERSION_LABEL: &str =
    "mutate.updaterequest.kyverno.io/trigger-apiversion";

pub const GENERATE_POLICY_LABEL: &str = "generate.kyverno.io/policy-name";
pub const GENERATE_RESOURCE_NAME_LABEL: &str = "generate.kyverno.io/resource-name";
pub const GENERATE_RESOURCE_KIND_LABEL: &str = "generate.kyverno.io/resource-kind";
pub const GENERATE_RESOURCE_NAMESPACE_LABEL: &str = "generate.kyverno.io/resource-namespace";

// Labels written on downstream resources
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kyverno";
pub const DOWNSTREAM_POLICY_NAME_LABEL: &str = GENERATE_POLICY_LABEL;
pub const DOWNSTREAM_POLICY_NAMESPACE_LABEL: &str = "generate.kyverno.io/policy-namespace";
pub const DOWNSTREAM_RULE_NAME_LABEL: &str = "generate.kyverno.io/rule-name";
pub const TRIGGER_GROUP_LABEL: &str = "generate.kyverno.io/trigger-group";
pub const TRIGGER_VERSION_LABEL: &str = "generate.kyverno.io/trigger-version";
pub const TRIGGER_KIND_LABEL: &str = "generate.kyverno.io/trigger-kind";
pub const TRIGGER_NAMESPACE_LABEL: &str = "generate.kyverno.io/trigger-namespace";
pub const TRIGGER_NAME_LABEL: &str = "generate.kyverno.io/trigger-name";
pub const TRIGGER_UID_LABEL: &str = "generate.kyverno.io/trigger-uid";
pub const SYNCHRONIZE_LABEL: &str = "policy.kyverno.io/synchronize";
pub const SYNCHRONIZE_ENABLED: &str = "enable";
pub const SYNCHRONIZE_DISABLED: &str = "disable";

/// Comma-separated list of policies cloning from a source resource
pub const CLONE_POLICY_NAME_LABEL: &str = "generate.kyverno.io/clone-policy-name";

/// Marks a downstream resource written in clone mode
pub const CLONE_SOURCE_LABEL: &str = "generate.kyverno.io/clone-source";

/// Orphan retry counter on URs
pub const RETRY_COUNT_ANNOTATION: &str = "generate.kyverno.io/retry-count";

/// Bumped to force re-reconciliation of a UR
pub const UPDATION_TIME_ANNOTATION: &str = "generate.kyverno.io/updation-time";

pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Finalizer guarding generate cleanup on policies
pub const CLEANUP_FINALIZER: &str = "generate.kyverno.io/cleanup";

/// Autogen opt-out annotation on policies
pub const AUTOGEN_CONTROLLERS_ANNOTATION: &str = "pod-policies.kyverno.io/autogen-controllers";

const MAX_LABEL_VALUE_LEN: usize = 63;

pub type Labels = BTreeMap<String, String>;

/// Truncate a value to the label value limit
pub fn label_value(value: &str) -> String {
    value.chars().take(MAX_LABEL_VALUE_LEN).collect()
}

/// Policy name without its namespace prefix
pub fn policy_name(policy_key: &str) -> &str {
    policy_key
        .split_once('/')
        .map_or(policy_key, |(_, name)| name)
}

/// Trigger identity as it appears in dedup labels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl From<&ResourceSpec> for TriggerKey {
    fn from(spec: &ResourceSpec) -> Self {
        Self {
            api_version: label_value(&spec.api_version.replace('/', "-")),
            kind: label_value(&spec.kind),
            namespace: label_value(&spec.namespace),
            name: label_value(&spec.name),
        }
    }
}

/// Deterministic identity of a UR: at most one live UR exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub request_type: RequestType,
    pub policy: String,
    pub trigger: Option<TriggerKey>,
}

impl DedupKey {
    pub fn new(
        request_type: RequestType,
        policy_key: &str,
        trigger: Option<&ResourceSpec>,
    ) -> Self {
        let mut trigger = trigger.map(TriggerKey::from);
        if request_type.is_generate() {
            // generate keys carry no api version
            if let Some(t) = trigger.as_mut() {
                t.api_version.clear();
            }
        }
        Self {
            request_type,
            policy: label_value(policy_name(policy_key)),
            trigger,
        }
    }

    /// Key selecting every UR of a policy
    pub fn for_policy(request_type: RequestType, policy_key: &str) -> Self {
        Self::new(request_type, policy_key, None)
    }

    /// Label set written on the UR and used as a selector
    pub fn labels(&self) -> Labels {
        let mut labels = Labels::new();
        if self.request_type.is_generate() {
            labels.insert(GENERATE_POLICY_LABEL.to_string(), self.policy.clone());
            if let Some(t) = &self.trigger {
                labels.insert(GENERATE_RESOURCE_NAME_LABEL.to_string(), t.name.clone());
                labels.insert(GENERATE_RESOURCE_KIND_LABEL.to_string(), t.kind.clone());
                labels.insert(GENERATE_RESOURCE_NAMESPACE_LABEL.to_string(), t.namespace.clone());
            }
        } else {
            labels.insert(MUTATE_POLICY_LABEL.to_string(), self.policy.clone());
            if let Some(t) = &self.trigger {
                labels.insert(MUTATE_TRIGGER_NAME_LABEL.to_string(), t.name.clone());
                labels.insert(MUTATE_TRIGGER_NAMESPACE_LABEL.to_string(), t.namespace.clone());
                labels.insert(MUTATE_TRIGGER_KIND_LABEL.to_string(), t.kind.clone());
                if !t.api_version.is_empty() {
                    labels.insert(
                        MUTATE_TRIGGER_API_VERSION_LABEL.to_string(),
                        t.api_version.clone(),
                    );
                }
            }
        }
        labels
    }

    /// Recover a key from a UR's labels
    ///
    /// Generate and CEL generate share a label family, so the request type is
    /// supplied by the caller when it matters.
    pub fn from_labels(labels: &Labels, request_type: RequestType) -> Option<Self> {
        let get = |k: &str| labels.get(k).cloned().unwrap_or_default();
        if request_type.is_generate() {
            let policy = labels.get(GENERATE_POLICY_LABEL)?.clone();
            let trigger = labels.contains_key(GENERATE_RESOURCE_NAME_LABEL).then(|| TriggerKey {
                api_version: String::new(),
                kind: get(GENERATE_RESOURCE_KIND_LABEL),
                namespace: get(GENERATE_RESOURCE_NAMESPACE_LABEL),
                name: get(GENERATE_RESOURCE_NAME_LABEL),
            });
            Some(Self {
                request_type,
                policy,
                trigger,
            })
        } else {
            let policy = labels.get(MUTATE_POLICY_LABEL)?.clone();
            let trigger = labels.contains_key(MUTATE_TRIGGER_NAME_LABEL).then(|| TriggerKey {
                api_version: get(MUTATE_TRIGGER_API_VERSION_LABEL),
                kind: get(MUTATE_TRIGGER_KIND_LABEL),
                namespace: get(MUTATE_TRIGGER_NAMESPACE_LABEL),
                name: get(MUTATE_TRIGGER_NAME_LABEL),
            });
            Some(Self {
                request_type,
                policy,
                trigger,
            })
        }
    }
}

/// Every selector entry is present with the same value
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Render a selector as `k=v,k2=v2`
pub fn format_selector(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `k=v,k2=v2`; entries without `=` are ignored
pub fn parse_selector(selector: &str) -> Labels {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Labels stamped on every downstream resource written for a rule
pub fn downstream_labels(
    policy_key: &str,
    rule: &str,
    trigger: Option<&ResourceSpec>,
    synchronize: bool,
) -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(
        DOWNSTREAM_POLICY_NAME_LABEL.to_string(),
        label_value(policy_name(policy_key)),
    );
    if let Some((ns, _)) = policy_key.split_once('/') {
        labels.insert(DOWNSTREAM_POLICY_NAMESPACE_LABEL.to_string(), label_value(ns));
    }
    labels.insert(DOWNSTREAM_RULE_NAME_LABEL.to_string(), label_value(rule));
    if let Some(trigger) = trigger {
        labels.extend(trigger_labels(trigger));
    }
    labels.insert(
        SYNCHRONIZE_LABEL.to_string(),
        if synchronize {
            SYNCHRONIZE_ENABLED
        } else {
            SYNCHRONIZE_DISABLED
        }
        .to_string(),
    );
    labels
}

/// Selector for the downstream resources of one rule, optionally narrowed to a trigger
pub fn downstream_selector(policy_key: &str, rule: &str, trigger: Option<&ResourceSpec>) -> Labels {
    let mut selector = Labels::new();
    selector.insert(
        DOWNSTREAM_POLICY_NAME_LABEL.to_string(),
        label_value(policy_name(policy_key)),
    );
    if let Some((ns, _)) = policy_key.split_once('/') {
        selector.insert(DOWNSTREAM_POLICY_NAMESPACE_LABEL.to_string(), label_value(ns));
    }
    selector.insert(DOWNSTREAM_RULE_NAME_LABEL.to_string(), label_value(rule));
    if let Some(trigger) = trigger {
        selector.insert(TRIGGER_KIND_LABEL.to_string(), label_value(&trigger.kind));
        selector.insert(TRIGGER_NAMESPACE_LABEL.to_string(), label_value(&trigger.namespace));
        selector.insert(TRIGGER_NAME_LABEL.to_string(), label_value(&trigger.name));
    }
    selector
}

/// Trigger identity labels on downstream resources
pub fn trigger_labels(trigger: &ResourceSpec) -> Labels {
    let mut labels = Labels::new();
    labels.insert(TRIGGER_GROUP_LABEL.to_string(), label_value(trigger.group()));
    labels.insert(TRIGGER_VERSION_LABEL.to_string(), label_value(trigger.version()));
    labels.insert(TRIGGER_KIND_LABEL.to_string(), label_value(&trigger.kind));
    labels.insert(TRIGGER_NAMESPACE_LABEL.to_string(), label_value(&trigger.namespace));
    labels.insert(TRIGGER_NAME_LABEL.to_string(), label_value(&trigger.name));
    if !trigger.uid.is_empty() {
        labels.insert(TRIGGER_UID_LABEL.to_string(), label_value(&trigger.uid));
    }
    labels
}

/// Rebuild the trigger identity from a downstream resource's labels
pub fn trigger_from_downstream(labels: &Labels) -> Option<ResourceSpec> {
    let name = labels.get(TRIGGER_NAME_LABEL)?;
    let kind = labels.get(TRIGGER_KIND_LABEL)?;
    let group = labels.get(TRIGGER_GROUP_LABEL).map_or("", String::as_str);
    let version = labels.get(TRIGGER_VERSION_LABEL).map_or("", String::as_str);
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    Some(ResourceSpec {
        api_version,
        kind: kind.clone(),
        namespace: labels.get(TRIGGER_NAMESPACE_LABEL).cloned().unwrap_or_default(),
        name: name.clone(),
        uid: labels.get(TRIGGER_UID_LABEL).cloned().unwrap_or_default(),
    })
}

/// Managed by the engine and kept in sync with its policy
pub fn is_synchronized_downstream(labels: &Labels) -> bool {
    labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
        && labels.get(SYNCHRONIZE_LABEL).map(String::as_str) == Some(SYNCHRONIZE_ENABLED)
        && labels.contains_key(DOWNSTREAM_POLICY_NAME_LABEL)
}

/// Policies listed in a clone source's label
pub fn clone_policies(labels: &Labels) -> Vec<String> {
    labels
        .get(CLONE_POLICY_NAME_LABEL)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Label keys injected by the engine, ignored when comparing content
pub fn is_engine_label(key: &str) -> bool {
    key == MANAGED_BY_LABEL
        || key.starts_with("generate.kyverno.io/")
        || key.starts_with("policy.kyverno.io/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> ResourceSpec {
        ResourceSpec::new("apps/v1", "Deployment", "team-a", "web")
    }

    #[test]
    fn test_generate_labels() {
        let key = DedupKey::new(RequestType::Generate, "ns/add-netpol", Some(&pod()));
        let labels = key.labels();
        assert_eq!(labels[GENERATE_POLICY_LABEL], "add-netpol");
        assert_eq!(labels[GENERATE_RESOURCE_NAME_LABEL], "web");
        assert_eq!(labels[GENERATE_RESOURCE_KIND_LABEL], "Deployment");
        assert_eq!(labels[GENERATE_RESOURCE_NAMESPACE_LABEL], "team-a");
        assert_eq!(labels.len(), 4);
    }

    #[test]
    fn test_mutate_labels_replace_slash_in_api_version() {
        let key = DedupKey::new(RequestType::Mutate, "add-sidecar", Some(&pod()));
        let labels = key.labels();
        assert_eq!(labels[MUTATE_POLICY_LABEL], "add-sidecar");
        assert_eq!(labels[MUTATE_TRIGGER_API_VERSION_LABEL], "apps-v1");
        assert_eq!(labels[MUTATE_TRIGGER_KIND_LABEL], "Deployment");
    }

    #[test]
    fn test_labels_round_trip_through_key() {
        let key = DedupKey::new(RequestType::Mutate, "p", Some(&pod()));
        let parsed = DedupKey::from_labels(&key.labels(), RequestType::Mutate).unwrap();
        assert_eq!(parsed, key);

        let policy_only = DedupKey::for_policy(RequestType::Generate, "p");
        let parsed = DedupKey::from_labels(&policy_only.labels(), RequestType::Generate).unwrap();
        assert_eq!(parsed.trigger, None);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let long = "x".repeat(80);
        let trigger = ResourceSpec::new("v1", "ConfigMap", "default", &long);
        let labels = DedupKey::new(RequestType::Generate, "p", Some(&trigger)).labels();
        assert_eq!(labels[GENERATE_RESOURCE_NAME_LABEL].len(), 63);
    }

    #[test]
    fn test_selector_helpers() {
        let selector = parse_selector("a=1, b=2,junk");
        assert_eq!(selector.len(), 2);
        assert_eq!(format_selector(&selector), "a=1,b=2");
        let mut labels = selector.clone();
        labels.insert("c".to_string(), "3".to_string());
        assert!(selector_matches(&selector, &labels));
        assert!(!selector_matches(&labels, &selector));
    }

    #[test]
    fn test_downstream_labels_carry_trigger() {
        let mut trigger = pod();
        trigger.uid = "uid-1".to_string();
        let labels = downstream_labels("team-a/p", "r", Some(&trigger), true);
        assert!(is_synchronized_downstream(&labels));
        assert_eq!(labels[DOWNSTREAM_POLICY_NAMESPACE_LABEL], "team-a");
        let recovered = trigger_from_downstream(&labels).unwrap();
        assert_eq!(recovered, trigger);
    }

    #[test]
    fn test_downstream_selector_matches_written_labels() {
        let trigger = pod();
        let written = downstream_labels("p", "r", Some(&trigger), false);
        assert!(selector_matches(&downstream_selector("p", "r", Some(&trigger)), &written));
        assert!(selector_matches(&downstream_selector("p", "r", None), &written));
        assert!(!selector_matches(&downstream_selector("p", "other", None), &written));
    }

    #[test]
    fn test_clone_policies() {
        let mut labels = Labels::new();
        labels.insert(CLONE_POLICY_NAME_LABEL.to_string(), "a, b,,c".to_string());
        assert_eq!(clone_policies(&labels), vec!["a", "b", "c"]);
        assert!(is_engine_label(CLONE_POLICY_NAME_LABEL));
        assert!(!is_engine_label("app"));
    }
}
