//! Shared fixtures for the scenario tests

#![allow(dead_code, reason = "each test binary uses a subset of the fixtures")]

use async_trait::async_trait;
use kube::api::DynamicObject;
use kyverno_background_controller::client::memory::InMemoryCluster;
use kyverno_background_controller::client::Clients;
use kyverno_background_controller::config::ControllerConfig;
use kyverno_background_controller::controller::backoff::BoundedBackoff;
use kyverno_background_controller::crd::{
    ClusterPolicy, CloneFrom, GeneratingPolicy, Generation, PolicySpec, RequestType,
    ResourceSpec, Rule, RuleContext, UpdateRequest, UpdateRequestSpec, UpdateRequestStatus,
    UrState,
};
use kyverno_background_controller::engine::{
    Engine, PolicyContext, RuleResponse, RuleStatus, RuleType, StaticEngine,
};
use kyverno_background_controller::labels::DedupKey;
use kyverno_background_controller::policy::compute_rules;
use kyverno_background_controller::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "kyverno";

/// Engine whose generate verdicts are scripted per rule name (default: pass)
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    verdicts: Mutex<HashMap<String, RuleStatus>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, rule: &str, status: RuleStatus) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(rule.to_string(), status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn apply_background_checks(&self, ctx: &PolicyContext) -> Result<Vec<RuleResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let verdicts = self.verdicts.lock().unwrap().clone();
        Ok(compute_rules(&ctx.policy)
            .into_iter()
            .filter_map(|rule| {
                let generation = rule.generate?;
                let status = verdicts.get(&rule.name).copied().unwrap_or(RuleStatus::Pass);
                let response = RuleResponse::new(rule.name, RuleType::Generation, status);
                Some(if status == RuleStatus::Pass {
                    response.with_generation(generation)
                } else {
                    response.with_message("scripted failure")
                })
            })
            .collect())
    }

    async fn mutate_existing(&self, ctx: &PolicyContext, rule: &str) -> Result<Vec<RuleResponse>> {
        StaticEngine::new().mutate_existing(ctx, rule).await
    }

    async fn evaluate_generating_policy(
        &self,
        policy: &GeneratingPolicy,
        trigger: &Value,
    ) -> Result<Vec<DynamicObject>> {
        StaticEngine::new()
            .evaluate_generating_policy(policy, trigger)
            .await
    }
}

pub fn cluster() -> Arc<InMemoryCluster> {
    InMemoryCluster::new(NAMESPACE)
}

pub fn clients(cluster: &Arc<InMemoryCluster>) -> Clients {
    Clients::new(cluster)
}

/// Config with millisecond queue delays and a fixed instance name
pub fn fast_config(instance: &str) -> ControllerConfig {
    ControllerConfig {
        namespace: NAMESPACE.to_string(),
        instance: instance.to_string(),
        background_workers: 1,
        queue_base_delay: Duration::from_millis(1),
        queue_max_delay: Duration::from_millis(5),
        generator_backoff: BoundedBackoff {
            initial: Duration::from_millis(1),
            multiplier: 1.5,
            max_delay: Duration::from_millis(2),
            budget: Duration::from_millis(10),
        },
        reclaim_stale_handlers: true,
        ..ControllerConfig::default()
    }
}

pub fn namespace_object(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name, "uid": format!("uid-{name}")}})
}

pub fn namespace_trigger(name: &str) -> ResourceSpec {
    ResourceSpec::new("v1", "Namespace", "", name)
}

/// Data rule writing ConfigMap `defaults` into namespace `team-a`
pub fn data_rule(name: &str, synchronize: bool) -> Rule {
    Rule {
        name: name.to_string(),
        generate: Some(Generation {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "team-a".to_string(),
            name: "defaults".to_string(),
            synchronize,
            data: Some(json!({"data": {"mode": "strict"}})),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Clone rule copying Secret `default/registry` into namespace `team-a`
pub fn clone_rule(name: &str, synchronize: bool) -> Rule {
    Rule {
        name: name.to_string(),
        generate: Some(Generation {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            namespace: "team-a".to_string(),
            name: "registry".to_string(),
            synchronize,
            clone: Some(CloneFrom {
                namespace: "default".to_string(),
                name: "registry".to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cluster_policy(name: &str, rules: Vec<Rule>) -> ClusterPolicy {
    ClusterPolicy::new(
        name,
        PolicySpec {
            rules,
            ..Default::default()
        },
    )
}

/// A generate UR as the generator would have stored it
pub fn generate_ur(
    name: &str,
    policy: &str,
    rule: &str,
    trigger: &ResourceSpec,
    state: Option<UrState>,
) -> UpdateRequest {
    let mut ur = UpdateRequest::new(
        name,
        UpdateRequestSpec {
            request_type: RequestType::Generate,
            policy: policy.to_string(),
            rule_context: vec![RuleContext {
                rule: rule.to_string(),
                trigger: trigger.clone(),
                synchronize: true,
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    ur.metadata.labels = Some(DedupKey::new(RequestType::Generate, policy, Some(trigger)).labels());
    ur.status = Some(UpdateRequestStatus {
        state,
        ..Default::default()
    });
    ur
}
