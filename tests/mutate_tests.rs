//! Mutate-existing URs driven through the background controller

mod common;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kyverno_background_controller::client::memory::InMemoryCluster;
use kyverno_background_controller::controller::background::BackgroundController;
use kyverno_background_controller::crd::{
    GeneratingPolicy, NamespacedPolicySpec, Policy, PolicySpec, RequestType, ResourceSpec, Rule,
    RuleContext, UpdateRequest, UpdateRequestSpec, UpdateRequestStatus, UrState,
};
use kyverno_background_controller::engine::{
    Engine, PolicyContext, RuleResponse, RuleStatus, RuleType, StaticEngine,
};
use kyverno_background_controller::event::{EventSink, RecordingEventSink};
use kyverno_background_controller::labels::DedupKey;
use kyverno_background_controller::Result;
use serde_json::{json, Value};
use std::sync::Arc;

const POLICY: &str = "team-a/label-cms";

/// Labels the trigger for rule `add-label`, rejects rule `deny`
#[derive(Debug)]
struct LabelingEngine;

#[async_trait]
impl Engine for LabelingEngine {
    async fn apply_background_checks(&self, ctx: &PolicyContext) -> Result<Vec<RuleResponse>> {
        StaticEngine::new().apply_background_checks(ctx).await
    }

    async fn mutate_existing(&self, ctx: &PolicyContext, rule: &str) -> Result<Vec<RuleResponse>> {
        if rule == "deny" {
            return Ok(vec![RuleResponse::new(rule, RuleType::Mutation, RuleStatus::Fail)
                .with_message("label value not allowed")]);
        }
        let mut target = ctx.new_resource.clone().unwrap_or_default();
        target["metadata"]["labels"] = json!({"team": "a"});
        let target: DynamicObject = serde_json::from_value(target)?;
        Ok(vec![RuleResponse::new(rule, RuleType::Mutation, RuleStatus::Pass)
            .with_patched_targets(vec![target])])
    }

    async fn evaluate_generating_policy(
        &self,
        policy: &GeneratingPolicy,
        trigger: &Value,
    ) -> Result<Vec<DynamicObject>> {
        StaticEngine::new().evaluate_generating_policy(policy, trigger).await
    }
}

fn mutate_rule(name: &str) -> Rule {
    Rule {
        name: name.to_string(),
        mutate: Some(json!({"targets": [{"apiVersion": "v1", "kind": "ConfigMap"}]})),
        ..Default::default()
    }
}

fn setup(
    rules: Vec<Rule>,
) -> (Arc<InMemoryCluster>, Arc<BackgroundController>, Arc<RecordingEventSink>) {
    let cluster = common::cluster();
    let mut policy = Policy::new(
        "label-cms",
        NamespacedPolicySpec {
            inner: PolicySpec {
                rules,
                ..Default::default()
            },
        },
    );
    policy.metadata.namespace = Some("team-a".to_string());
    cluster.insert_policy(policy);
    cluster
        .insert_object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "team-a"},
            "data": {"level": "debug"}
        }))
        .unwrap();

    let recorder = Arc::new(RecordingEventSink::new());
    let engine: Arc<dyn Engine> = Arc::new(LabelingEngine);
    let events = Arc::clone(&recorder) as Arc<dyn EventSink>;
    let controller = BackgroundController::new(
        common::clients(&cluster),
        &engine,
        &events,
        common::fast_config("pod-a"),
    );
    (cluster, controller, recorder)
}

fn settings() -> ResourceSpec {
    ResourceSpec::new("v1", "ConfigMap", "team-a", "settings")
}

fn mutate_ur(name: &str, rule: &str) -> UpdateRequest {
    let mut ur = UpdateRequest::new(
        name,
        UpdateRequestSpec {
            request_type: RequestType::Mutate,
            policy: POLICY.to_string(),
            rule_context: vec![RuleContext {
                rule: rule.to_string(),
                trigger: settings(),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    ur.metadata.labels =
        Some(DedupKey::new(RequestType::Mutate, POLICY, Some(&settings())).labels());
    ur.status = Some(UpdateRequestStatus {
        state: Some(UrState::Pending),
        ..Default::default()
    });
    ur
}

#[tokio::test]
async fn test_patched_target_is_written_and_ur_retired() {
    let (cluster, controller, recorder) = setup(vec![mutate_rule("add-label")]);
    cluster.insert_update_request(mutate_ur("ur-m1", "add-label"));

    controller.sync("ur-m1").await.unwrap();

    let live = serde_json::to_value(cluster.object(&settings()).unwrap()).unwrap();
    assert_eq!(live["metadata"]["labels"]["team"], "a");
    assert_eq!(live["data"]["level"], "debug");
    // completed URs are removed by the status pass
    assert!(cluster.update_request("ur-m1").is_none());
    assert!(recorder.warnings().is_empty());
    assert_eq!(recorder.events().len(), 1);
}

#[tokio::test]
async fn test_failing_rule_marks_ur_failed() {
    let (cluster, controller, recorder) = setup(vec![mutate_rule("deny")]);
    cluster.insert_update_request(mutate_ur("ur-m2", "deny"));

    let err = controller.sync("ur-m2").await.unwrap_err();
    assert!(err.to_string().contains("label value not allowed"));

    let ur = cluster.update_request("ur-m2").unwrap();
    assert_eq!(ur.state(), Some(UrState::Failed));
    assert!(ur.handler().is_empty());
    assert!(ur.status.as_ref().unwrap().message.contains("label value not allowed"));
    assert_eq!(recorder.warnings().len(), 1);
    let live = serde_json::to_value(cluster.object(&settings()).unwrap()).unwrap();
    assert!(live["metadata"]["labels"].is_null());
}

#[tokio::test]
async fn test_missing_policy_removes_every_mutate_ur_of_the_policy() {
    let cluster = common::cluster();
    let engine: Arc<dyn Engine> = Arc::new(LabelingEngine);
    let events: Arc<dyn EventSink> = Arc::new(RecordingEventSink::new());
    let controller = BackgroundController::new(
        common::clients(&cluster),
        &engine,
        &events,
        common::fast_config("pod-a"),
    );
    cluster.insert_update_request(mutate_ur("ur-m3", "add-label"));
    let mut sibling = mutate_ur("ur-m4", "add-label");
    sibling.spec.rule_context[0].trigger = ResourceSpec::new("v1", "ConfigMap", "team-a", "other");
    let trigger = sibling.spec.rule_context[0].trigger.clone();
    sibling.metadata.labels =
        Some(DedupKey::new(RequestType::Mutate, POLICY, Some(&trigger)).labels());
    cluster.insert_update_request(sibling);

    controller.sync("ur-m3").await.unwrap();

    assert!(cluster.update_requests().is_empty());
}
