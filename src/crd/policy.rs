//! # Policies
//!
//! The subset of the Kyverno `ClusterPolicy` and `Policy` schema the background
//! controller reads. Match blocks, preconditions and mutate overlays stay opaque:
//! they are interpreted by the rule engine, never by the controller.

use kube::core::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cluster-scoped Kyverno policy
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterPolicy",
    group = "kyverno.io",
    version = "v1",
    shortname = "cpol"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Apply generate rules to resources that existed before the policy
    #[serde(default)]
    pub generate_existing: bool,
    #[serde(default)]
    pub mutate_existing_on_policy_update: bool,
}

/// Namespaced Kyverno policy
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Policy",
    group = "kyverno.io",
    version = "v1",
    namespaced,
    shortname = "pol"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedPolicySpec {
    #[serde(flatten)]
    pub inner: PolicySpec,
}

/// A single policy rule
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_resources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<Generation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<serde_json::Value>,
}

impl Rule {
    pub fn has_generate(&self) -> bool {
        self.generate.is_some()
    }

    /// Whether the rule's preconditions require `request.operation == DELETE`
    pub fn fires_on_delete(&self) -> bool {
        fn visit(value: &serde_json::Value) -> bool {
            match value {
                serde_json::Value::Object(map) => {
                    let keyed_on_operation = map
                        .get("key")
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|k| k.contains("request.operation"));
                    let wants_delete = match map.get("value") {
                        Some(serde_json::Value::String(s)) => s == "DELETE",
                        Some(serde_json::Value::Array(items)) => {
                            items.iter().any(|i| i.as_str() == Some("DELETE"))
                        }
                        _ => false,
                    };
                    (keyed_on_operation && wants_delete) || map.values().any(visit)
                }
                serde_json::Value::Array(items) => items.iter().any(visit),
                _ => false,
            }
        }
        self.preconditions.as_ref().is_some_and(visit)
    }
}

/// Generate rule body
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub synchronize: bool,
    #[serde(default)]
    pub orphan_downstream_on_policy_delete: bool,
    /// Literal object content (data mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Single clone source (clone mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneFrom>,
    /// Several clone sources selected by kind and labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_list: Option<CloneList>,
}

impl Generation {
    pub fn is_clone(&self) -> bool {
        self.clone.as_ref().is_some_and(|c| !c.name.is_empty()) || self.clone_list.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloneFrom {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloneList {
    #[serde(default)]
    pub namespace: String,
    /// Entries in `apiVersion/kind` form, e.g. `v1/Secret`
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Label selector in `k=v,k2=v2` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

/// Either policy kind, resolved from a `name` or `namespace/name` key
#[derive(Debug, Clone)]
pub enum AnyPolicy {
    Cluster(Arc<ClusterPolicy>),
    Namespaced(Arc<Policy>),
}

impl AnyPolicy {
    pub fn spec(&self) -> &PolicySpec {
        match self {
            AnyPolicy::Cluster(p) => &p.spec,
            AnyPolicy::Namespaced(p) => &p.spec.inner,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            AnyPolicy::Cluster(p) => &p.metadata,
            AnyPolicy::Namespaced(p) => &p.metadata,
        }
    }

    pub fn name(&self) -> String {
        match self {
            AnyPolicy::Cluster(p) => p.name_any(),
            AnyPolicy::Namespaced(p) => p.name_any(),
        }
    }

    /// Empty for cluster policies
    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    /// Key used in `UpdateRequest.spec.policy`
    pub fn key(&self) -> String {
        let namespace = self.namespace();
        if namespace.is_empty() {
            self.name()
        } else {
            format!("{namespace}/{}", self.name())
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn has_generate_rules(&self) -> bool {
        self.spec().rules.iter().any(Rule::has_generate)
    }
}

/// Split a policy key into `(namespace, name)`
pub fn parse_policy_key(key: &str) -> crate::Result<(Option<&str>, &str)> {
    match key.split_once('/') {
        None if !key.is_empty() => Ok((None, key)),
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((Some(ns), name))
        }
        _ => Err(crate::Error::InvalidPolicyKey(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy_key() {
        assert_eq!(parse_policy_key("cpol").unwrap(), (None, "cpol"));
        assert_eq!(parse_policy_key("team-a/pol").unwrap(), (Some("team-a"), "pol"));
        assert!(parse_policy_key("").is_err());
        assert!(parse_policy_key("a/b/c").is_err());
        assert!(parse_policy_key("/name").is_err());
    }

    #[test]
    fn test_fires_on_delete() {
        let rule = Rule {
            name: "on-delete".to_string(),
            preconditions: Some(serde_json::json!({
                "all": [{"key": "{{request.operation}}", "operator": "Equals", "value": "DELETE"}]
            })),
            ..Default::default()
        };
        assert!(rule.fires_on_delete());

        let create_only = Rule {
            name: "on-create".to_string(),
            preconditions: Some(serde_json::json!({
                "any": [{"key": "{{request.operation}}", "operator": "AnyIn", "value": ["CREATE", "UPDATE"]}]
            })),
            ..Default::default()
        };
        assert!(!create_only.fires_on_delete());
    }

    #[test]
    fn test_namespaced_policy_key() {
        let mut policy = Policy::new("restrict", NamespacedPolicySpec::default());
        policy.metadata.namespace = Some("team-a".to_string());
        let any = AnyPolicy::Namespaced(Arc::new(policy));
        assert_eq!(any.key(), "team-a/restrict");

        let global = ClusterPolicy::new("global", PolicySpec::default());
        let cluster = AnyPolicy::Cluster(Arc::new(global));
        assert_eq!(cluster.key(), "global");
        assert!(!cluster.has_generate_rules());
    }

    #[test]
    fn test_clone_detection() {
        let data = Generation {
            data: Some(serde_json::json!({"data": {"a": "b"}})),
            ..Default::default()
        };
        assert!(!data.is_clone());
        let clone = Generation {
            clone: Some(CloneFrom {
                namespace: "default".to_string(),
                name: "regcred".to_string(),
            }),
            ..Default::default()
        };
        assert!(clone.is_clone());
    }
}
