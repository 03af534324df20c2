//! # Cleanup Controller
//!
//! Ties downstream lifecycle to policy and trigger lifecycle.
//!
//! - **Policy deletion** is held back by the `generate.kyverno.io/cleanup`
//!   finalizer until the policy's URs and non-retained downstream resources
//!   are gone.
//! - **Orphan detection** re-checks generate URs without an active claim. Once
//!   a trigger is missing and the retry count has reached the threshold, the
//!   UR and everything it generated are deleted. Below the threshold the UR is
//!   left for a later pass.

use crate::client::{object_labels, Clients};
use crate::config::ControllerConfig;
use crate::controller::generate::downstream;
use crate::controller::queue::{handle_result, WorkQueue};
use crate::controller::updater;
use crate::crd::{AnyPolicy, RequestType, ResourceSpec, Rule, UpdateRequest, UrState};
use crate::labels::{
    clone_policies, policy_name, DedupKey, Labels, CLEANUP_FINALIZER, CLONE_POLICY_NAME_LABEL,
};
use crate::observability::metrics;
use crate::policy::{compute_rules, retains_downstream};
use crate::Result;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument, Level};

pub const QUEUE_NAME: &str = "cleanup";

/// Work item of the cleanup queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CleanupKey {
    /// `name` or `namespace/name` of a policy
    Policy(String),
    /// Name of a UR in the controller namespace
    UpdateRequest(String),
}

pub struct CleanupController {
    clients: Clients,
    config: ControllerConfig,
    queue: Arc<WorkQueue<CleanupKey>>,
}

impl std::fmt::Debug for CleanupController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupController")
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl CleanupController {
    pub fn new(clients: Clients, config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: WorkQueue::new(QUEUE_NAME, config.rate_limiter()),
            clients,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<CleanupKey>> {
        &self.queue
    }

    /// Policy added, updated or marked for deletion
    pub fn on_policy_event(&self, policy: &AnyPolicy) {
        if policy.has_generate_rules() || policy.is_deleting() {
            self.queue.add(CleanupKey::Policy(policy.key()));
        }
    }

    /// UR added, updated or deleted
    pub fn on_update_request(&self, ur: &UpdateRequest) {
        if ur.spec.request_type.is_generate()
            && ur.handler().is_empty()
            && ur.state() != Some(UrState::Pending)
        {
            self.queue.add(CleanupKey::UpdateRequest(ur.name_any()));
        }
    }

    /// Enqueue every idle generate UR for an orphan check
    pub async fn resync(&self) -> Result<()> {
        let urs = self.clients.urs.list(&Labels::new()).await?;
        let mut enqueued = 0usize;
        for ur in urs
            .iter()
            .filter(|ur| ur.spec.request_type.is_generate() && ur.state() != Some(UrState::Pending))
        {
            self.queue.add(CleanupKey::UpdateRequest(ur.name_any()));
            enqueued += 1;
        }
        debug!(enqueued, "orphan resync");
        Ok(())
    }

    /// Run workers and the periodic resync until `shutdown` resolves
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let workers: Vec<_> = (0..self.config.cleanup_workers)
            .map(|id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.worker(id).await })
            })
            .collect();

        let resync = {
            let controller = Arc::clone(&self);
            let period = controller.config.orphan_resync_interval.max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // first tick fires immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = controller.resync().await {
                        warn!(error = %e, "orphan resync failed");
                    }
                }
            })
        };
        info!(workers = workers.len(), "🔄 cleanup controller started");

        shutdown.await;
        resync.abort();
        self.queue.shutdown();
        futures::future::join_all(workers).await;
        info!("cleanup controller stopped");
    }

    async fn worker(&self, id: usize) {
        while let Some(key) = self.queue.get().await {
            let span =
                tracing::span!(Level::INFO, "controller.cleanup.sync", key = ?key, worker = id);
            let result = self.sync(&key).instrument(span).await;
            handle_result(&self.queue, &key, &result, self.config.max_retries);
            self.queue.done(&key);
        }
    }

    pub async fn sync(&self, key: &CleanupKey) -> Result<()> {
        match key {
            CleanupKey::Policy(policy_key) => self.sync_policy(policy_key).await,
            CleanupKey::UpdateRequest(name) => self.check_orphan(name).await,
        }
    }

    /// Keep the finalizer on live policies and run cleanup for deleting ones
    pub async fn sync_policy(&self, policy_key: &str) -> Result<()> {
        let policy = match self.clients.policies.get_policy(policy_key).await {
            Ok(policy) => policy,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let has_finalizer = policy.finalizers().iter().any(|f| f == CLEANUP_FINALIZER);

        if !policy.is_deleting() {
            if policy.has_generate_rules() && !has_finalizer {
                let mut finalizers = policy.finalizers().to_vec();
                finalizers.push(CLEANUP_FINALIZER.to_string());
                self.clients.policies.set_finalizers(&policy, finalizers).await?;
                info!(policy = policy_key, "added cleanup finalizer");
            }
            return Ok(());
        }
        if !has_finalizer {
            return Ok(());
        }

        self.cleanup_policy(&policy).await?;
        let finalizers: Vec<String> = policy
            .finalizers()
            .iter()
            .filter(|f| *f != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        self.clients.policies.set_finalizers(&policy, finalizers).await?;
        info!(policy = policy_key, "✅ policy cleanup finished, finalizer removed");
        Ok(())
    }

    /// Delete a policy's URs and the downstream of rules that do not retain it
    async fn cleanup_policy(&self, policy: &AnyPolicy) -> Result<()> {
        let key = policy.key();
        let rules: Vec<Rule> = compute_rules(policy)
            .into_iter()
            .filter(Rule::has_generate)
            .collect();
        let retained: HashSet<&str> = rules
            .iter()
            .filter(|rule| retains_downstream(rule))
            .map(|rule| rule.name.as_str())
            .collect();

        let selector = DedupKey::for_policy(RequestType::Generate, &key).labels();
        let urs: Vec<UpdateRequest> = self
            .clients
            .urs
            .list(&selector)
            .await?
            .into_iter()
            .filter(|ur| ur.spec.policy == key && ur.spec.request_type == RequestType::Generate)
            .collect();

        let mut targets: Vec<ResourceSpec> = Vec::new();
        for rule in &rules {
            if retained.contains(rule.name.as_str()) {
                if rule.generate.as_ref().is_some_and(|g| g.is_clone() && g.synchronize) {
                    self.unlabel_clone_sources(&key, rule).await?;
                }
                continue;
            }
            let found = downstream::find(self.clients.resources.as_ref(), &key, rule, None).await?;
            targets.extend(found);
        }
        for ur in &urs {
            let owns_only_removed_rules = ur
                .spec
                .rule_context
                .iter()
                .all(|rc| !retained.contains(rc.rule.as_str()));
            if owns_only_removed_rules {
                targets.extend(ur.generated_resources().iter().cloned());
            }
        }
        downstream::delete_all(self.clients.resources.as_ref(), &targets, "policy-deleted").await?;

        for ur in &urs {
            match self.clients.urs.delete(&ur.name_any()).await {
                Ok(()) => metrics::increment_update_requests_deleted("policy-deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        info!(
            policy = %key,
            update_requests = urs.len(),
            retained_rules = retained.len(),
            "cleaned up deleted policy"
        );
        Ok(())
    }

    /// Drop the policy from the clone-policy list of the rule's clone sources
    async fn unlabel_clone_sources(&self, policy_key: &str, rule: &Rule) -> Result<()> {
        let Some(generation) = rule.generate.as_ref() else {
            return Ok(());
        };
        let mut sources: Vec<DynamicObject> = Vec::new();
        if let Some(clone) = generation.clone.as_ref().filter(|c| !c.name.is_empty()) {
            let source = ResourceSpec::new(
                &generation.api_version,
                &generation.kind,
                &clone.namespace,
                &clone.name,
            );
            match self.clients.resources.get(&source).await {
                Ok(obj) => sources.push(obj),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(list) = &generation.clone_list {
            for (api_version, kind) in list.kinds.iter().filter_map(|k| k.rsplit_once('/')) {
                match self
                    .clients
                    .resources
                    .list(api_version, kind, &list.namespace, list.selector.as_deref())
                    .await
                {
                    Ok(objects) => sources.extend(objects),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let name = policy_name(policy_key);
        for mut source in sources {
            let mut labels = object_labels(&source);
            let policies = clone_policies(&labels);
            if !policies.iter().any(|p| p == name) {
                continue;
            }
            let remaining: Vec<String> = policies.into_iter().filter(|p| p != name).collect();
            if remaining.is_empty() {
                labels.remove(CLONE_POLICY_NAME_LABEL);
            } else {
                labels.insert(CLONE_POLICY_NAME_LABEL.to_string(), remaining.join(","));
            }
            source.metadata.labels = Some(labels);
            match self.clients.resources.update(&source).await {
                Ok(_) => {
                    debug!(source = %source.name_any(), policy = name, "unlabelled clone source");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete an idle generate UR whose trigger has been missing long enough
    pub async fn check_orphan(&self, name: &str) -> Result<()> {
        let ur = match self.clients.urs.get(name).await {
            Ok(ur) => ur,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !ur.spec.request_type.is_generate()
            || !ur.handler().is_empty()
            || ur.state() == Some(UrState::Pending)
        {
            return Ok(());
        }

        let retry_count = updater::retry_count(&ur)?;
        let mut trigger_missing = false;
        for trigger in ur.triggers() {
            match self.clients.resources.get(trigger).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    trigger_missing = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if !trigger_missing {
            return Ok(());
        }
        if retry_count < self.config.orphan_retry_threshold {
            debug!(ur.name = name, retry_count, "trigger missing, below orphan threshold");
            return Ok(());
        }

        warn!(ur.name = name, retry_count, "deleting orphaned update request");
        downstream::delete_all(
            self.clients.resources.as_ref(),
            ur.generated_resources(),
            "orphaned",
        )
        .await?;
        match self.clients.urs.delete(name).await {
            Ok(()) => metrics::increment_update_requests_deleted("orphaned"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
