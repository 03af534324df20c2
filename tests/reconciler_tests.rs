//! Background controller: claims, retries and terminal cleanup

mod common;

use common::{
    cluster_policy, data_rule, generate_ur, namespace_object, namespace_trigger, ScriptedEngine,
};
use kyverno_background_controller::config::ControllerConfig;
use kyverno_background_controller::controller::background::{claim, status, BackgroundController};
use kyverno_background_controller::crd::{ResourceSpec, UrState};
use kyverno_background_controller::engine::{Engine, RuleStatus};
use kyverno_background_controller::event::{EventSink, RecordingEventSink};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    cluster: Arc<kyverno_background_controller::client::memory::InMemoryCluster>,
    engine: Arc<ScriptedEngine>,
    events: Arc<RecordingEventSink>,
}

impl Fixture {
    fn new() -> Self {
        let cluster = common::cluster();
        cluster.insert_cluster_policy(cluster_policy("ns-defaults", vec![data_rule("cm", true)]));
        cluster.insert_object(namespace_object("team-a")).unwrap();
        Self {
            cluster,
            engine: ScriptedEngine::new(),
            events: Arc::new(RecordingEventSink::new()),
        }
    }

    fn controller(&self, instance: &str) -> Arc<BackgroundController> {
        self.controller_with(common::fast_config(instance))
    }

    fn controller_with(&self, config: ControllerConfig) -> Arc<BackgroundController> {
        let engine = Arc::clone(&self.engine) as Arc<dyn Engine>;
        let events = Arc::clone(&self.events) as Arc<dyn EventSink>;
        BackgroundController::new(common::clients(&self.cluster), &engine, &events, config)
    }

    /// Pending UR already claimed by `handler` at `claimed_at`
    fn claimed_ur(&self, name: &str, handler: &str, claimed_at: &str) {
        let mut ur = generate_ur(
            name,
            "ns-defaults",
            "cm",
            &namespace_trigger("team-a"),
            Some(UrState::Pending),
        );
        let status = ur.status.as_mut().unwrap();
        status.handler = handler.to_string();
        status.claimed_at = Some(claimed_at.to_string());
        self.cluster.insert_update_request(ur);
    }

    fn running_pod(&self, name: &str) {
        self.cluster
            .insert_object(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name, "namespace": "kyverno"}
            }))
            .unwrap();
    }

    fn pending_ur(&self, name: &str) {
        self.cluster.insert_update_request(generate_ur(
            name,
            "ns-defaults",
            "cm",
            &namespace_trigger("team-a"),
            Some(UrState::Pending),
        ));
    }
}

const LONG_AGO: &str = "2020-01-01T00:00:00.000Z";

fn generated_configmap() -> ResourceSpec {
    ResourceSpec::new("v1", "ConfigMap", "team-a", "defaults")
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let fixture = Fixture::new();
    fixture.pending_ur("ur-1");
    let store = common::clients(&fixture.cluster).urs;

    let (a, b) = tokio::join!(
        claim::acquire(store.as_ref(), "ur-1", "pod-a"),
        claim::acquire(store.as_ref(), "ur-1", "pod-b"),
    );
    let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_concurrent_workers_process_once() {
    let fixture = Fixture::new();
    fixture.pending_ur("ur-1");
    let a = fixture.controller("pod-a");
    let b = fixture.controller("pod-b");

    let (ra, rb) = tokio::join!(a.sync("ur-1"), b.sync("ur-1"));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(fixture.engine.calls(), 1);
    assert!(fixture.cluster.object(&generated_configmap()).is_some());
    assert!(fixture.cluster.update_request("ur-1").is_none());
}

#[tokio::test]
async fn test_foreign_live_handler_means_no_side_effects() {
    let fixture = Fixture::new();
    let mut ur = generate_ur(
        "ur-1",
        "ns-defaults",
        "cm",
        &namespace_trigger("team-a"),
        Some(UrState::Pending),
    );
    ur.status.as_mut().unwrap().handler = "pod-b".to_string();
    fixture.cluster.insert_update_request(ur);
    fixture.running_pod("pod-b");
    let writes_before = fixture.cluster.status_writes();

    fixture.controller("pod-a").sync("ur-1").await.unwrap();

    assert_eq!(fixture.engine.calls(), 0);
    assert_eq!(fixture.cluster.status_writes(), writes_before);
    assert!(fixture.cluster.object(&generated_configmap()).is_none());
    assert_eq!(fixture.cluster.update_request("ur-1").unwrap().handler(), "pod-b");
}

#[tokio::test]
async fn test_fresh_claim_of_other_replica_is_left_alone() {
    let fixture = Fixture::new();
    fixture.pending_ur("ur-1");
    let store = common::clients(&fixture.cluster).urs;
    // neither replica name matches a pod
    claim::acquire(store.as_ref(), "ur-1", "background-controller-aaaa")
        .await
        .unwrap()
        .unwrap();

    let other = fixture.controller("background-controller-bbbb");
    other.sync("ur-1").await.unwrap();
    other.sync("ur-1").await.unwrap();

    assert_eq!(fixture.engine.calls(), 0);
    assert!(other.queue().is_empty());
    let ur = fixture.cluster.update_request("ur-1").unwrap();
    assert_eq!(ur.handler(), "background-controller-aaaa");
    assert_eq!(ur.state(), Some(UrState::Pending));
    assert!(fixture.cluster.object(&generated_configmap()).is_none());
}

#[tokio::test]
async fn test_stale_handler_is_released() {
    let fixture = Fixture::new();
    fixture.claimed_ur("ur-1", "crashed-pod", LONG_AGO);

    let controller = fixture.controller("pod-a");
    controller.sync("ur-1").await.unwrap();
    let released = fixture.cluster.update_request("ur-1").unwrap();
    assert_eq!(released.handler(), "");
    assert!(released.claimed_at().is_none());
    assert_eq!(controller.queue().len(), 1);

    controller.sync("ur-1").await.unwrap();
    assert!(fixture.cluster.update_request("ur-1").is_none());
}

#[tokio::test]
async fn test_expired_claim_of_running_pod_is_kept() {
    let fixture = Fixture::new();
    fixture.claimed_ur("ur-1", "pod-b", LONG_AGO);
    fixture.running_pod("pod-b");

    let controller = fixture.controller("pod-a");
    controller.sync("ur-1").await.unwrap();

    assert_eq!(fixture.cluster.update_request("ur-1").unwrap().handler(), "pod-b");
    assert!(controller.queue().is_empty());
    assert_eq!(fixture.engine.calls(), 0);
}

#[tokio::test]
async fn test_reclaim_disabled_keeps_expired_claim() {
    let fixture = Fixture::new();
    fixture.claimed_ur("ur-1", "crashed-pod", LONG_AGO);

    let controller = fixture.controller_with(ControllerConfig {
        reclaim_stale_handlers: false,
        ..common::fast_config("pod-a")
    });
    controller.sync("ur-1").await.unwrap();

    assert_eq!(fixture.cluster.update_request("ur-1").unwrap().handler(), "crashed-pod");
    assert_eq!(fixture.engine.calls(), 0);
}

#[tokio::test]
async fn test_completed_ur_is_deleted() {
    let fixture = Fixture::new();
    fixture.pending_ur("ur-1");
    fixture.controller("pod-a").sync("ur-1").await.unwrap();
    assert!(fixture.cluster.update_request("ur-1").is_none());
    assert_eq!(fixture.events.events().len(), 1);
}

#[tokio::test]
async fn test_empty_state_moves_to_pending_first() {
    let fixture = Fixture::new();
    fixture.cluster.insert_update_request(generate_ur(
        "ur-1",
        "ns-defaults",
        "cm",
        &namespace_trigger("team-a"),
        None,
    ));
    let controller = fixture.controller("pod-a");
    controller.sync("ur-1").await.unwrap();
    assert_eq!(
        fixture.cluster.update_request("ur-1").unwrap().state(),
        Some(UrState::Pending)
    );
    assert_eq!(fixture.engine.calls(), 0);
    assert_eq!(controller.queue().len(), 1);
}

#[tokio::test]
async fn test_missing_policy_removes_ur() {
    let fixture = Fixture::new();
    fixture.cluster.insert_update_request(generate_ur(
        "ur-1",
        "gone",
        "cm",
        &namespace_trigger("team-a"),
        Some(UrState::Pending),
    ));
    fixture.controller("pod-a").sync("ur-1").await.unwrap();
    assert!(fixture.cluster.update_request("ur-1").is_none());
    assert_eq!(fixture.engine.calls(), 0);
}

#[tokio::test]
async fn test_failing_rule_is_retried_ten_times_then_left_failed() {
    let fixture = Fixture::new();
    fixture.engine.set("cm", RuleStatus::Fail);
    fixture.pending_ur("ur-1");

    let controller = fixture.controller("pod-a");
    controller.queue().add("ur-1".to_string());
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(Arc::clone(&controller).run(async move {
        let _ = stopped.await;
    }));

    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.engine.calls() < 11 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ten retries within the timeout");
    // the key has been dropped: no twelfth attempt
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.engine.calls(), 11);

    stop.send(()).unwrap();
    running.await.unwrap();

    let ur = fixture.cluster.update_request("ur-1").unwrap();
    assert_eq!(ur.state(), Some(UrState::Failed));
    assert!(ur.status.as_ref().unwrap().message.contains("scripted failure"));
    assert!(ur.handler().is_empty());
}

#[tokio::test]
async fn test_transient_refetch_error_propagates() {
    let fixture = Fixture::new();
    fixture.cluster.insert_update_request(generate_ur(
        "ur-1",
        "ns-defaults",
        "cm",
        &namespace_trigger("team-a"),
        Some(UrState::Completed),
    ));
    let store = common::clients(&fixture.cluster).urs;

    fixture.cluster.fail_next_get("ur-1", 503, "etcd leader changed");
    let result = status::reconcile_status(store.as_ref(), "ur-1").await;
    assert!(result.is_err());
    assert!(fixture.cluster.update_request("ur-1").is_some());

    let state = status::reconcile_status(store.as_ref(), "ur-1").await.unwrap();
    assert_eq!(state, Some(UrState::Completed));
    assert!(fixture.cluster.update_request("ur-1").is_none());
}
