//! # Background Controller
//!
//! Drains the UR work queue with a pool of workers. Each key goes through:
//!
//! 1. **resolve**: a missing UR is already done
//! 2. **policy check**: a UR whose policy is gone is torn down, never retried
//! 3. **claim**: compare-and-swap `status.handler`; a foreign claim means back off
//! 4. **execute**: generate, CEL generate or mutate-existing
//! 5. **release** the claim, then **reconcile status** (Completed URs are deleted)
//!
//! Errors go through the queue's retry policy: `NotFound` forgets the key, any
//! other error is requeued until the retry ceiling drops it.

pub mod claim;
pub mod status;

use crate::client::{object_labels, Clients};
use crate::config::ControllerConfig;
use crate::controller::generate::cel::CelGenerateExecutor;
use crate::controller::generate::{downstream, GenerateExecutor};
use crate::controller::mutate::MutateExecutor;
use crate::controller::queue::{handle_result, WorkQueue};
use crate::controller::updater;
use crate::crd::{RequestType, ResourceSpec, UpdateRequest, UrState};
use crate::engine::Engine;
use crate::event::EventSink;
use crate::labels::{is_synchronized_downstream, DedupKey, CLONE_SOURCE_LABEL};
use crate::observability::metrics;
use crate::Result;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument, Level};

pub const QUEUE_NAME: &str = "background";

/// Watch-fed reconciler of UpdateRequests
pub struct BackgroundController {
    clients: Clients,
    config: ControllerConfig,
    queue: Arc<WorkQueue<String>>,
    generate: GenerateExecutor,
    cel: CelGenerateExecutor,
    mutate: MutateExecutor,
}

impl std::fmt::Debug for BackgroundController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundController")
            .field("instance", &self.config.instance)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl BackgroundController {
    pub fn new(
        clients: Clients,
        engine: &Arc<dyn Engine>,
        events: &Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let threshold = config.orphan_retry_threshold;
        Arc::new(Self {
            generate: GenerateExecutor::new(
                clients.clone(),
                Arc::clone(engine),
                Arc::clone(events),
                threshold,
            ),
            cel: CelGenerateExecutor::new(
                clients.clone(),
                Arc::clone(engine),
                Arc::clone(events),
                threshold,
            ),
            mutate: MutateExecutor::new(clients.clone(), Arc::clone(engine), Arc::clone(events)),
            queue: WorkQueue::new(QUEUE_NAME, config.rate_limiter()),
            clients,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// UR added or updated: only Pending (or brand new) records need work
    pub fn on_update_request_applied(&self, ur: &UpdateRequest) {
        if matches!(ur.state(), None | Some(UrState::Pending)) {
            self.queue.add(ur.name_any());
        }
    }

    /// UR deleted without an active claim
    pub fn on_update_request_deleted(&self, ur: &UpdateRequest) {
        if ur.handler().is_empty() {
            self.queue.add(ur.name_any());
        }
    }

    /// Policy added, updated or deleted: re-evaluate every UR that references it
    pub async fn enqueue_policy(&self, policy_key: &str) {
        for request_type in [RequestType::Generate, RequestType::Mutate] {
            let selector = DedupKey::for_policy(request_type, policy_key).labels();
            match self.clients.urs.list(&selector).await {
                Ok(urs) => {
                    for ur in urs.iter().filter(|ur| ur.spec.policy == policy_key) {
                        self.queue.add(ur.name_any());
                    }
                }
                Err(e) => {
                    warn!(policy = policy_key, error = %e, "failed to list policy update requests");
                }
            }
        }
    }

    /// Run the worker pool until `shutdown` resolves, then drain in-flight keys
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let workers: Vec<_> = (0..self.config.background_workers)
            .map(|id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.worker(id).await })
            })
            .collect();
        info!(workers = workers.len(), "🔄 background controller started");

        shutdown.await;
        info!("background controller draining");
        self.queue.shutdown();
        futures::future::join_all(workers).await;
        info!("background controller stopped");
    }

    async fn worker(&self, id: usize) {
        while let Some(key) = self.queue.get().await {
            let span = tracing::span!(
                Level::INFO,
                "controller.background.sync",
                ur.name = %key,
                worker = id
            );
            let start = Instant::now();
            let result = self.sync(&key).instrument(span).await;
            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            if result.is_err() {
                metrics::increment_reconciliation_errors();
            }
            handle_result(&self.queue, &key, &result, self.config.max_retries);
            self.queue.done(&key);
        }
        debug!(worker = id, "background worker exiting");
    }

    /// Process one UR by name
    pub async fn sync(&self, name: &str) -> Result<()> {
        let urs = self.clients.urs.as_ref();
        let ur = match urs.get(name).await {
            Ok(ur) => ur,
            Err(e) if e.is_not_found() => {
                debug!(ur.name = name, "update request gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(state) = ur.state() else {
            updater::mark_pending(urs, name).await?;
            self.queue.add(name.to_string());
            return Ok(());
        };

        let handler = ur.handler();
        if !handler.is_empty() && handler != self.config.instance {
            if self.claim_is_abandoned(&ur).await? {
                warn!(ur.name = name, handler, "claim expired and handler gone, releasing");
                claim::release(urs, name, handler).await?;
                self.queue.add(name.to_string());
            } else {
                debug!(ur.name = name, handler, "update request claimed by another handler");
            }
            return Ok(());
        }

        if !self.policy_exists(&ur).await? {
            return self.handle_policy_missing(&ur).await;
        }

        match state {
            UrState::Completed => {
                status::reconcile_status(urs, name).await?;
                return Ok(());
            }
            UrState::Skip => return Ok(()),
            UrState::Pending | UrState::Failed => {}
        }

        let instance = self.config.instance.as_str();
        let claimed = match claim::acquire(urs, name, instance).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(ur.name = name, "update request gone before it could be claimed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        // another worker may have finished it between our read and the claim
        if !matches!(claimed.state(), Some(UrState::Pending | UrState::Failed)) {
            return claim::release(urs, name, instance).await;
        }

        let result = self.process(&claimed).await;
        if let Err(e) = claim::release(urs, name, instance).await {
            warn!(ur.name = name, error = %e, "failed to release claim");
            if result.is_ok() {
                return Err(e);
            }
        }
        result?;

        metrics::increment_reconciliations(claimed.spec.request_type.as_str());
        status::reconcile_status(urs, name).await?;
        Ok(())
    }

    async fn process(&self, ur: &UpdateRequest) -> Result<()> {
        match ur.spec.request_type {
            RequestType::Generate => self.generate.process(ur).await,
            RequestType::CelGenerate => self.cel.process(ur).await,
            RequestType::Mutate => self.mutate.process(ur).await,
        }
    }

    /// A foreign claim has outlived the claim timeout and its handler pod no longer exists
    async fn claim_is_abandoned(&self, ur: &UpdateRequest) -> Result<bool> {
        if !self.config.reclaim_stale_handlers || !claim::expired(ur, self.config.claim_timeout) {
            return Ok(false);
        }
        let pod = ResourceSpec::new("v1", "Pod", &self.config.namespace, ur.handler());
        match self.clients.resources.get(&pod).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn policy_exists(&self, ur: &UpdateRequest) -> Result<bool> {
        let found = match ur.spec.request_type {
            RequestType::CelGenerate => self
                .clients
                .policies
                .get_generating_policy(&ur.spec.policy)
                .await
                .map(|_| ()),
            RequestType::Generate | RequestType::Mutate => self
                .clients
                .policies
                .get_policy(&ur.spec.policy)
                .await
                .map(|_| ()),
        };
        match found {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Tear down a UR whose policy no longer exists
    async fn handle_policy_missing(&self, ur: &UpdateRequest) -> Result<()> {
        let name = ur.name_any();
        info!(ur.name = %name, policy = %ur.spec.policy, "policy gone, removing update request");

        let mut names = vec![name];
        if ur.spec.request_type.is_generate() {
            let mut targets = Vec::new();
            for target in ur.generated_resources() {
                match self.clients.resources.get(target).await {
                    Ok(live) => {
                        let labels = object_labels(&live);
                        // clone downstream outlives its policy
                        if is_synchronized_downstream(&labels)
                            && !labels.contains_key(CLONE_SOURCE_LABEL)
                        {
                            targets.push(target.clone());
                        }
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            downstream::delete_all(self.clients.resources.as_ref(), &targets, "policy-missing")
                .await?;
        } else {
            let selector = DedupKey::for_policy(RequestType::Mutate, &ur.spec.policy).labels();
            names.extend(
                self.clients
                    .urs
                    .list(&selector)
                    .await?
                    .iter()
                    .filter(|other| other.spec.policy == ur.spec.policy)
                    .map(ResourceExt::name_any),
            );
        }

        names.sort();
        names.dedup();
        for name in names {
            match self.clients.urs.delete(&name).await {
                Ok(()) => metrics::increment_update_requests_deleted("policy-missing"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::crd::{RuleContext, UpdateRequestSpec, UpdateRequestStatus};
    use crate::engine::StaticEngine;
    use crate::event::RecordingEventSink;

    fn controller(cluster: &Arc<InMemoryCluster>) -> Arc<BackgroundController> {
        let engine: Arc<dyn Engine> = Arc::new(StaticEngine::new());
        let events: Arc<dyn EventSink> = Arc::new(RecordingEventSink::new());
        let config = ControllerConfig::default();
        BackgroundController::new(Clients::new(cluster), &engine, &events, config)
    }

    fn ur(name: &str, policy: &str, state: Option<UrState>) -> UpdateRequest {
        let trigger = ResourceSpec::new("v1", "Namespace", "", name);
        let mut ur = UpdateRequest::new(
            name,
            UpdateRequestSpec {
                request_type: RequestType::Generate,
                policy: policy.to_string(),
                rule_context: vec![RuleContext {
                    rule: "r".to_string(),
                    trigger: trigger.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        ur.metadata.labels =
            Some(DedupKey::new(RequestType::Generate, policy, Some(&trigger)).labels());
        ur.status = Some(UpdateRequestStatus {
            state,
            ..Default::default()
        });
        ur
    }

    #[tokio::test]
    async fn test_only_pending_or_new_urs_are_queued() {
        let cluster = InMemoryCluster::new("kyverno");
        let controller = controller(&cluster);
        controller.on_update_request_applied(&ur("a", "p", None));
        controller.on_update_request_applied(&ur("b", "p", Some(UrState::Pending)));
        controller.on_update_request_applied(&ur("c", "p", Some(UrState::Completed)));
        controller.on_update_request_applied(&ur("d", "p", Some(UrState::Failed)));
        assert_eq!(controller.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_policy_change_queues_its_urs() {
        let cluster = InMemoryCluster::new("kyverno");
        cluster.insert_update_request(ur("a", "p", Some(UrState::Completed)));
        cluster.insert_update_request(ur("b", "p", Some(UrState::Failed)));
        cluster.insert_update_request(ur("c", "other", Some(UrState::Pending)));
        let controller = controller(&cluster);

        controller.enqueue_policy("p").await;

        assert_eq!(controller.queue().len(), 2);
    }
}
