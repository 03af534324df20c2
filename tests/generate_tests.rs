//! Generate executor scenarios driven through the background controller

mod common;

use common::{
    clone_rule, cluster_policy, data_rule, generate_ur, namespace_object, namespace_trigger,
    ScriptedEngine,
};
use kyverno_background_controller::client::memory::InMemoryCluster;
use kyverno_background_controller::controller::background::BackgroundController;
use kyverno_background_controller::crd::{ResourceSpec, Rule, UrState};
use kyverno_background_controller::engine::Engine;
use kyverno_background_controller::event::{EventSink, RecordingEventSink};
use kyverno_background_controller::labels::{CLONE_POLICY_NAME_LABEL, CLONE_SOURCE_LABEL};
use serde_json::{json, Value};
use std::sync::Arc;

fn setup(rule: Rule) -> (Arc<InMemoryCluster>, Arc<BackgroundController>) {
    let cluster = common::cluster();
    cluster.insert_cluster_policy(cluster_policy("p", vec![rule]));
    cluster.insert_object(namespace_object("team-a")).unwrap();
    let engine: Arc<dyn Engine> = ScriptedEngine::new();
    let events: Arc<dyn EventSink> = Arc::new(RecordingEventSink::new());
    let controller = BackgroundController::new(
        common::clients(&cluster),
        &engine,
        &events,
        common::fast_config("pod-a"),
    );
    (cluster, controller)
}

async fn run_ur(
    cluster: &InMemoryCluster,
    controller: &BackgroundController,
    name: &str,
    rule: &str,
) {
    cluster.insert_update_request(generate_ur(
        name,
        "p",
        rule,
        &namespace_trigger("team-a"),
        Some(UrState::Pending),
    ));
    controller.sync(name).await.unwrap();
}

fn configmap() -> ResourceSpec {
    ResourceSpec::new("v1", "ConfigMap", "team-a", "defaults")
}

fn live(cluster: &InMemoryCluster, target: &ResourceSpec) -> Value {
    serde_json::to_value(cluster.object(target).unwrap()).unwrap()
}

fn tamper_configmap(cluster: &InMemoryCluster) {
    let mut edited = live(cluster, &configmap());
    edited["data"]["mode"] = json!("lax");
    cluster.insert_object(edited).unwrap();
}

#[tokio::test]
async fn test_synchronized_data_drift_is_corrected() {
    let (cluster, controller) = setup(data_rule("cm", true));
    run_ur(&cluster, &controller, "ur-1", "cm").await;
    assert_eq!(live(&cluster, &configmap())["data"]["mode"], "strict");

    tamper_configmap(&cluster);
    run_ur(&cluster, &controller, "ur-2", "cm").await;
    assert_eq!(live(&cluster, &configmap())["data"]["mode"], "strict");
}

#[tokio::test]
async fn test_unsynchronized_data_is_left_alone() {
    let (cluster, controller) = setup(data_rule("cm", false));
    run_ur(&cluster, &controller, "ur-1", "cm").await;
    tamper_configmap(&cluster);

    run_ur(&cluster, &controller, "ur-2", "cm").await;
    assert_eq!(live(&cluster, &configmap())["data"]["mode"], "lax");
}

#[tokio::test]
async fn test_clone_strips_volatile_fields_and_labels_source() {
    let (cluster, controller) = setup(clone_rule("registry", true));
    cluster
        .insert_object(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "registry",
                "namespace": "default",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "team": "platform"
                },
                "ownerReferences": [{"apiVersion": "v1", "kind": "ConfigMap", "name": "owner", "uid": "1"}]
            },
            "data": {"token": "c2VjcmV0"}
        }))
        .unwrap();

    run_ur(&cluster, &controller, "ur-1", "registry").await;

    let clone = live(&cluster, &ResourceSpec::new("v1", "Secret", "team-a", "registry"));
    assert_eq!(clone["data"]["token"], "c2VjcmV0");
    assert_eq!(clone["metadata"]["annotations"]["team"], "platform");
    assert!(clone["metadata"]["annotations"]
        .get("kubectl.kubernetes.io/last-applied-configuration")
        .is_none());
    assert!(clone["metadata"].get("ownerReferences").is_none());
    assert_eq!(clone["metadata"]["labels"][CLONE_SOURCE_LABEL], "registry");

    let source = live(&cluster, &ResourceSpec::new("v1", "Secret", "default", "registry"));
    assert_eq!(source["metadata"]["labels"][CLONE_POLICY_NAME_LABEL], "p");
}

#[tokio::test]
async fn test_missing_clone_source_leaves_ur_failed() {
    let (cluster, controller) = setup(clone_rule("registry", true));
    cluster.insert_update_request(generate_ur(
        "ur-1",
        "p",
        "registry",
        &namespace_trigger("team-a"),
        Some(UrState::Pending),
    ));
    assert!(controller.sync("ur-1").await.is_err());
    let ur = cluster.update_request("ur-1").unwrap();
    assert_eq!(ur.state(), Some(UrState::Failed));
    assert!(ur.handler().is_empty());
}

#[tokio::test]
async fn test_delete_downstream_removes_generated_resources() {
    let (cluster, controller) = setup(data_rule("cm", true));
    run_ur(&cluster, &controller, "ur-1", "cm").await;
    assert!(cluster.object(&configmap()).is_some());

    let trigger = namespace_trigger("team-a");
    let mut ur = generate_ur("ur-2", "p", "cm", &trigger, Some(UrState::Pending));
    ur.spec.rule_context[0].delete_downstream = true;
    cluster.insert_update_request(ur);
    controller.sync("ur-2").await.unwrap();

    assert!(cluster.object(&configmap()).is_none());
    assert!(cluster.update_request("ur-2").is_none());
}
