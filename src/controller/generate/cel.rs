//! # CEL Generate Executor
//!
//! Processes `celgenerate` URs produced for `GeneratingPolicy` matches. The
//! engine evaluates the policy against the trigger and returns the downstream
//! objects; this executor stamps ownership labels on them and writes them with
//! the same create-or-synchronize rules as classic generate.

use super::{clone, downstream, trigger, Outcome};
use crate::client::Clients;
use crate::crd::{Operation, ResourceSpec, UpdateRequest};
use crate::engine::Engine;
use crate::event::EventSink;
use crate::labels::downstream_labels;
use crate::Result;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, Instrument, Level};

pub struct CelGenerateExecutor {
    clients: Clients,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    orphan_retry_threshold: u32,
}

impl std::fmt::Debug for CelGenerateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelGenerateExecutor")
            .field("orphan_retry_threshold", &self.orphan_retry_threshold)
            .finish_non_exhaustive()
    }
}

impl CelGenerateExecutor {
    pub fn new(
        clients: Clients,
        engine: Arc<dyn Engine>,
        events: Arc<dyn EventSink>,
        orphan_retry_threshold: u32,
    ) -> Self {
        Self {
            clients,
            engine,
            events,
            orphan_retry_threshold,
        }
    }

    pub async fn process(&self, ur: &UpdateRequest) -> Result<()> {
        let span = tracing::span!(
            Level::INFO,
            "controller.celgenerate.process",
            ur.name = %ur.name_any(),
            policy = %ur.spec.policy
        );
        self.process_contexts(ur).instrument(span).await
    }

    async fn process_contexts(&self, ur: &UpdateRequest) -> Result<()> {
        let policy = self
            .clients
            .policies
            .get_generating_policy(&ur.spec.policy)
            .await?;
        let policy_name = policy.name_any();
        let synchronize = policy.spec.synchronize_enabled();
        let mut outcome = Outcome::starting_from(ur);

        for rc in &ur.spec.rule_context {
            if rc.delete_downstream {
                let targets = outcome.generated.clone();
                let deleted = downstream::delete_all(
                    self.clients.resources.as_ref(),
                    &targets,
                    "delete-downstream",
                )
                .await?;
                outcome.forget(&deleted);
                outcome.applied += 1;
                continue;
            }

            let Some(trigger) =
                trigger::load(self.clients.resources.as_ref(), ur, &rc.trigger).await?
            else {
                if ur.operation() == Some(Operation::Delete) {
                    debug!(trigger = %rc.trigger, "trigger deleted, skipping");
                    continue;
                }
                return trigger::handle_missing(
                    &self.clients,
                    ur,
                    &rc.trigger,
                    self.orphan_retry_threshold,
                )
                .await;
            };

            let objects = match self
                .engine
                .evaluate_generating_policy(&policy, &trigger)
                .await
            {
                Ok(objects) => objects,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    outcome
                        .failures
                        .push((ResourceSpec::from_object(&trigger), e.to_string()));
                    continue;
                }
            };

            let mut trigger_spec = ResourceSpec::from_object(&trigger);
            if trigger_spec.name.is_empty() {
                trigger_spec.clone_from(&rc.trigger);
            }
            let labels =
                downstream_labels(&policy_name, &policy_name, Some(&trigger_spec), synchronize);
            for mut desired in objects {
                desired
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .extend(labels.clone());
                let content = serde_json::to_value(&desired)?;
                if let Some(written) = downstream::write(
                    self.clients.resources.as_ref(),
                    desired,
                    synchronize,
                    &outcome.generated,
                    |live| clone::in_sync(live, &content),
                )
                .await?
                {
                    outcome.written.push(written);
                }
            }
            outcome.applied += 1;
        }

        let source = format!("generating policy {policy_name}");
        outcome
            .finish(&self.clients, self.events.as_ref(), ur, &source)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::crd::{
        GeneratingPolicy, GeneratingPolicyEvaluation, GeneratingPolicySpec, RequestType,
        RuleContext, Toggle, UpdateRequestSpec, UrState,
    };
    use crate::engine::StaticEngine;
    use crate::event::RecordingEventSink;
    use serde_json::json;

    fn setup(generate: Vec<serde_json::Value>) -> (Arc<InMemoryCluster>, CelGenerateExecutor) {
        let cluster = InMemoryCluster::new("kyverno");
        cluster.insert_generating_policy(GeneratingPolicy::new(
            "quota",
            GeneratingPolicySpec {
                evaluation: Some(GeneratingPolicyEvaluation {
                    synchronize: Some(Toggle { enabled: true }),
                    ..Default::default()
                }),
                generate,
                ..Default::default()
            },
        ));
        cluster
            .insert_object(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "team-a"}
            }))
            .unwrap();
        let executor = CelGenerateExecutor::new(
            Clients::new(&cluster),
            Arc::new(StaticEngine::new()),
            Arc::new(RecordingEventSink::new()),
            3,
        );
        (cluster, executor)
    }

    fn stored_ur(cluster: &InMemoryCluster) -> UpdateRequest {
        cluster.insert_update_request(UpdateRequest::new(
            "ur-cel",
            UpdateRequestSpec {
                request_type: RequestType::CelGenerate,
                policy: "quota".to_string(),
                rule_context: vec![RuleContext {
                    rule: "quota".to_string(),
                    trigger: ResourceSpec::new("v1", "Namespace", "", "team-a"),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_generated_objects_are_labelled_and_recorded() {
        let (cluster, executor) = setup(vec![json!({
            "apiVersion": "v1", "kind": "ResourceQuota",
            "metadata": {"name": "default", "namespace": "team-a"},
            "spec": {"hard": {"pods": "10"}}
        })]);
        let ur = stored_ur(&cluster);
        executor.process(&ur).await.unwrap();

        let target = ResourceSpec::new("v1", "ResourceQuota", "team-a", "default");
        let quota = serde_json::to_value(cluster.object(&target).unwrap()).unwrap();
        assert_eq!(quota["metadata"]["labels"]["generate.kyverno.io/policy-name"], "quota");
        assert_eq!(quota["metadata"]["labels"]["policy.kyverno.io/synchronize"], "enable");
        let stored = cluster.update_request("ur-cel").unwrap();
        assert_eq!(stored.state(), Some(UrState::Completed));
        assert_eq!(stored.generated_resources().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_error_marks_failed() {
        let (cluster, executor) = setup(vec![json!("object.metadata.name")]);
        let ur = stored_ur(&cluster);
        assert!(executor.process(&ur).await.is_err());
        assert_eq!(
            cluster.update_request("ur-cel").unwrap().state(),
            Some(UrState::Failed)
        );
    }

    #[tokio::test]
    async fn test_delete_downstream_removes_recorded_objects() {
        let (cluster, executor) = setup(vec![json!({
            "apiVersion": "v1", "kind": "ResourceQuota",
            "metadata": {"name": "default", "namespace": "team-a"},
            "spec": {"hard": {"pods": "10"}}
        })]);
        let ur = stored_ur(&cluster);
        executor.process(&ur).await.unwrap();

        let mut stored = cluster.update_request("ur-cel").unwrap();
        stored.spec.rule_context[0].delete_downstream = true;
        executor.process(&stored).await.unwrap();

        let target = ResourceSpec::new("v1", "ResourceQuota", "team-a", "default");
        assert!(cluster.object(&target).is_none());
        let stored = cluster.update_request("ur-cel").unwrap();
        assert_eq!(stored.state(), Some(UrState::Completed));
        assert!(stored.generated_resources().is_empty());
    }
}
