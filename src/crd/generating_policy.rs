//! # GeneratingPolicy
//!
//! CEL-based generate policy. Only the fields that drive background dispatch are
//! typed; the generate expressions are evaluated by the rule engine.

use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "GeneratingPolicy",
    group = "policies.kyverno.io",
    version = "v1alpha1",
    shortname = "gpol"
)]
#[serde(rename_all = "camelCase")]
pub struct GeneratingPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<GeneratingPolicyEvaluation>,
    /// Generate expressions, opaque to the controller
    #[serde(default)]
    pub generate: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchConstraints {
    #[serde(default)]
    pub resource_rules: Vec<ResourceRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    /// CREATE, UPDATE, DELETE, CONNECT or `*`
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratingPolicyEvaluation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronize: Option<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_downstream_on_policy_delete: Option<Toggle>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct Toggle {
    #[serde(default)]
    pub enabled: bool,
}

impl GeneratingPolicySpec {
    /// Deletion of a matching resource is itself a trigger
    pub fn matches_delete(&self) -> bool {
        self.match_constraints.as_ref().is_some_and(|mc| {
            mc.resource_rules.iter().any(|rule| {
                rule.operations
                    .iter()
                    .any(|op| op == "DELETE" || op == "*")
            })
        })
    }

    pub fn synchronize_enabled(&self) -> bool {
        self.evaluation
            .as_ref()
            .and_then(|e| e.synchronize.as_ref())
            .is_some_and(|t| t.enabled)
    }

    pub fn orphan_downstream_on_policy_delete(&self) -> bool {
        self.evaluation
            .as_ref()
            .and_then(|e| e.orphan_downstream_on_policy_delete.as_ref())
            .is_some_and(|t| t.enabled)
    }
}
