//! # Rule Engine Contract
//!
//! The controllers never interpret match blocks, preconditions, variables or
//! patches. They hand a [`PolicyContext`] to an [`Engine`] and act on the rule
//! responses it returns.

use crate::crd::{AnyPolicy, Generation, GeneratingPolicy, Operation, RequestInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::fmt;

/// Everything the engine needs to evaluate one policy against one resource
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub policy: AnyPolicy,
    pub new_resource: Option<serde_json::Value>,
    pub old_resource: Option<serde_json::Value>,
    pub operation: Option<Operation>,
    pub user_info: RequestInfo,
    pub namespace_labels: BTreeMap<String, String>,
}

impl PolicyContext {
    pub fn new(policy: AnyPolicy) -> Self {
        Self {
            policy,
            new_resource: None,
            old_resource: None,
            operation: None,
            user_info: RequestInfo::default(),
            namespace_labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_new_resource(mut self, resource: Option<serde_json::Value>) -> Self {
        self.new_resource = resource;
        self
    }

    #[must_use]
    pub fn with_old_resource(mut self, resource: Option<serde_json::Value>) -> Self {
        self.old_resource = resource;
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: Option<Operation>) -> Self {
        self.operation = operation;
        self
    }

    #[must_use]
    pub fn with_user_info(mut self, user_info: RequestInfo) -> Self {
        self.user_info = user_info;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Generation,
    Mutation,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleStatus::Pass => "pass",
            RuleStatus::Fail => "fail",
            RuleStatus::Warn => "warn",
            RuleStatus::Error => "error",
            RuleStatus::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Outcome of one rule
#[derive(Debug, Clone)]
pub struct RuleResponse {
    pub name: String,
    pub rule_type: RuleType,
    pub status: RuleStatus,
    pub message: String,
    /// Generate body after variable substitution
    pub generation: Option<Generation>,
    /// Targets patched by a mutate-existing rule
    pub patched_targets: Vec<DynamicObject>,
}

impl RuleResponse {
    pub fn new(name: impl Into<String>, rule_type: RuleType, status: RuleStatus) -> Self {
        Self {
            name: name.into(),
            rule_type,
            status,
            message: String::new(),
            generation: None,
            patched_targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    #[must_use]
    pub fn with_patched_targets(mut self, targets: Vec<DynamicObject>) -> Self {
        self.patched_targets = targets;
        self
    }

    pub fn passed(&self) -> bool {
        self.status == RuleStatus::Pass
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Evaluate generate (and other background) rules of `ctx.policy`
    async fn apply_background_checks(&self, ctx: &PolicyContext) -> Result<Vec<RuleResponse>>;

    /// Evaluate one mutate-existing rule, returning patched targets
    async fn mutate_existing(&self, ctx: &PolicyContext, rule: &str) -> Result<Vec<RuleResponse>>;

    /// Evaluate a CEL generating policy for a trigger, returning downstream objects
    async fn evaluate_generating_policy(
        &self,
        policy: &GeneratingPolicy,
        trigger: &serde_json::Value,
    ) -> Result<Vec<DynamicObject>>;
}

/// Engine that applies declared rules as written
///
/// Generate rules always pass with their declared body, mutate-existing rules
/// are skipped and CEL generating policies are only supported when their
/// `generate` entries are literal objects. Used when no policy evaluator is
/// wired in and by tests.
#[derive(Debug, Default)]
pub struct StaticEngine;

impl StaticEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for StaticEngine {
    async fn apply_background_checks(&self, ctx: &PolicyContext) -> Result<Vec<RuleResponse>> {
        Ok(crate::policy::compute_rules(&ctx.policy)
            .into_iter()
            .filter_map(|rule| {
                let generation = rule.generate?;
                Some(
                    RuleResponse::new(rule.name, RuleType::Generation, RuleStatus::Pass)
                        .with_generation(generation),
                )
            })
            .collect())
    }

    async fn mutate_existing(&self, _ctx: &PolicyContext, rule: &str) -> Result<Vec<RuleResponse>> {
        Ok(vec![RuleResponse::new(rule, RuleType::Mutation, RuleStatus::Skip)
            .with_message("mutate-existing requires a policy evaluator")])
    }

    async fn evaluate_generating_policy(
        &self,
        policy: &GeneratingPolicy,
        _trigger: &serde_json::Value,
    ) -> Result<Vec<DynamicObject>> {
        policy
            .spec
            .generate
            .iter()
            .map(|entry| {
                if !entry.is_object() {
                    return Err(Error::Engine(format!(
                        "generate expression {entry} needs a CEL evaluator"
                    )));
                }
                Ok(serde_json::from_value(entry.clone())?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterPolicy, GeneratingPolicySpec, PolicySpec, Rule};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_static_engine_passes_generate_rules() {
        let policy = ClusterPolicy::new(
            "p",
            PolicySpec {
                rules: vec![
                    Rule {
                        name: "gen".to_string(),
                        generate: Some(Generation::default()),
                        ..Default::default()
                    },
                    Rule {
                        name: "validate".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        );
        let ctx = PolicyContext::new(AnyPolicy::Cluster(Arc::new(policy)));
        let responses = StaticEngine::new().apply_background_checks(&ctx).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].passed());
        assert!(responses[0].generation.is_some());

        let mutated = StaticEngine::new().mutate_existing(&ctx, "m").await.unwrap();
        assert_eq!(mutated[0].status, RuleStatus::Skip);
    }

    #[tokio::test]
    async fn test_static_engine_rejects_cel_expressions() {
        let policy = GeneratingPolicy::new(
            "g",
            GeneratingPolicySpec {
                generate: vec![serde_json::json!("object.metadata.name")],
                ..Default::default()
            },
        );
        let result = StaticEngine::new()
            .evaluate_generating_policy(&policy, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(Error::Engine(_))));
    }
}
