//! # Watches
//!
//! One long-lived watch per input kind. Each feeds the shared caches and
//! enqueues work on the controllers:
//!
//! - `UpdateRequest` (controller namespace): [`UpdateRequestIndex`], background and cleanup queues
//! - `ClusterPolicy`, `Policy`: [`PolicyCache`], cleanup finalizers, UR re-evaluation
//! - `GeneratingPolicy`: [`PolicyCache`], UR re-evaluation
//!
//! A failed stream is classified by [`handle_watch_stream_error`] and restarted.

use super::error_policy::handle_watch_stream_error;
use crate::client::cache::{PolicyCache, UpdateRequestIndex};
use crate::constants::{DEFAULT_WATCH_INITIAL_BACKOFF_MS, DEFAULT_WATCH_MAX_BACKOFF_MS};
use crate::controller::background::BackgroundController;
use crate::controller::cleanup::{CleanupController, CleanupKey};
use crate::crd::{AnyPolicy, ClusterPolicy, GeneratingPolicy, Policy, UpdateRequest};
use crate::labels::Labels;
use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the events of one watch
#[async_trait]
pub trait WatchHandler<K>: Send + Sync {
    async fn handle(&self, event: watcher::Event<K>);
}

/// Watch `api` forever, restarting the stream after errors
pub async fn watch_forever<K, H>(watch: &'static str, api: Api<K>, handler: Arc<H>)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    H: WatchHandler<K> + ?Sized,
{
    let backoff = Arc::new(AtomicU64::new(DEFAULT_WATCH_INITIAL_BACKOFF_MS));
    loop {
        info!(watch, "starting watch");
        let stream = watcher(api.clone(), watcher::Config::default());
        pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    backoff.store(DEFAULT_WATCH_INITIAL_BACKOFF_MS, Ordering::Relaxed);
                    handler.handle(event).await;
                }
                Err(e) => {
                    let restart = handle_watch_stream_error(
                        watch,
                        &e.to_string(),
                        &backoff,
                        DEFAULT_WATCH_MAX_BACKOFF_MS,
                    )
                    .await
                    .is_none();
                    if restart {
                        break;
                    }
                }
            }
        }
        warn!(watch, "watch stream ended, restarting");
    }
}

/// UpdateRequest events
pub struct UpdateRequestEvents {
    index: Arc<UpdateRequestIndex>,
    background: Arc<BackgroundController>,
    cleanup: Arc<CleanupController>,
    relisted: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for UpdateRequestEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRequestEvents")
            .field("cached", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl UpdateRequestEvents {
    pub fn new(
        index: Arc<UpdateRequestIndex>,
        background: Arc<BackgroundController>,
        cleanup: Arc<CleanupController>,
    ) -> Self {
        Self {
            index,
            background,
            cleanup,
            relisted: Mutex::new(HashSet::new()),
        }
    }

    fn applied(&self, ur: &UpdateRequest) {
        self.index.apply(ur);
        self.background.on_update_request_applied(ur);
        self.cleanup.on_update_request(ur);
    }
}

#[async_trait]
impl WatchHandler<UpdateRequest> for UpdateRequestEvents {
    async fn handle(&self, event: watcher::Event<UpdateRequest>) {
        match event {
            watcher::Event::Apply(ur) => self.applied(&ur),
            watcher::Event::Delete(ur) => {
                debug!(ur.name = %ur.name_any(), "update request deleted");
                self.index.remove(&ur.name_any());
                self.background.on_update_request_deleted(&ur);
            }
            watcher::Event::Init => {
                self.relisted.lock().unwrap_or_else(PoisonError::into_inner).clear();
            }
            watcher::Event::InitApply(ur) => {
                self.relisted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(ur.name_any());
                self.applied(&ur);
            }
            watcher::Event::InitDone => {
                let relisted = {
                    let mut relisted = self.relisted.lock().unwrap_or_else(PoisonError::into_inner);
                    std::mem::take(&mut *relisted)
                };
                // drop entries deleted while the watch was down
                for stale in self
                    .index
                    .list(&Labels::new())
                    .iter()
                    .map(|ur| ur.name_any())
                    .filter(|name| !relisted.contains(name))
                {
                    self.index.remove(&stale);
                }
                info!(update_requests = self.index.len(), "update request cache synced");
            }
        }
    }
}

/// ClusterPolicy and Policy events
pub struct PolicyEvents {
    cache: Arc<PolicyCache>,
    background: Arc<BackgroundController>,
    cleanup: Arc<CleanupController>,
}

impl std::fmt::Debug for PolicyEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvents").finish_non_exhaustive()
    }
}

impl PolicyEvents {
    pub fn new(
        cache: Arc<PolicyCache>,
        background: Arc<BackgroundController>,
        cleanup: Arc<CleanupController>,
    ) -> Self {
        Self {
            cache,
            background,
            cleanup,
        }
    }

    async fn applied(&self, policy: AnyPolicy, initial: bool) {
        self.cleanup.on_policy_event(&policy);
        if !initial {
            self.background.enqueue_policy(&policy.key()).await;
        }
    }

    async fn deleted(&self, key: String) {
        info!(policy = %key, "policy deleted");
        self.background.enqueue_policy(&key).await;
        self.cleanup.queue().add(CleanupKey::Policy(key));
    }
}

#[async_trait]
impl WatchHandler<ClusterPolicy> for PolicyEvents {
    async fn handle(&self, event: watcher::Event<ClusterPolicy>) {
        match event {
            watcher::Event::Apply(policy) => {
                self.cache.apply_cluster_policy(policy.clone());
                self.applied(AnyPolicy::Cluster(Arc::new(policy)), false).await;
            }
            watcher::Event::InitApply(policy) => {
                self.cache.apply_cluster_policy(policy.clone());
                self.applied(AnyPolicy::Cluster(Arc::new(policy)), true).await;
            }
            watcher::Event::Delete(policy) => {
                let name = policy.name_any();
                self.cache.remove_cluster_policy(&name);
                self.deleted(name).await;
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

#[async_trait]
impl WatchHandler<Policy> for PolicyEvents {
    async fn handle(&self, event: watcher::Event<Policy>) {
        match event {
            watcher::Event::Apply(policy) => {
                self.cache.apply_policy(policy.clone());
                self.applied(AnyPolicy::Namespaced(Arc::new(policy)), false).await;
            }
            watcher::Event::InitApply(policy) => {
                self.cache.apply_policy(policy.clone());
                self.applied(AnyPolicy::Namespaced(Arc::new(policy)), true).await;
            }
            watcher::Event::Delete(policy) => {
                let key = AnyPolicy::Namespaced(Arc::new(policy)).key();
                self.cache.remove_policy(&key);
                self.deleted(key).await;
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

/// GeneratingPolicy events
pub struct GeneratingPolicyEvents {
    cache: Arc<PolicyCache>,
    background: Arc<BackgroundController>,
}

impl std::fmt::Debug for GeneratingPolicyEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratingPolicyEvents").finish_non_exhaustive()
    }
}

impl GeneratingPolicyEvents {
    pub fn new(cache: Arc<PolicyCache>, background: Arc<BackgroundController>) -> Self {
        Self { cache, background }
    }
}

#[async_trait]
impl WatchHandler<GeneratingPolicy> for GeneratingPolicyEvents {
    async fn handle(&self, event: watcher::Event<GeneratingPolicy>) {
        match event {
            watcher::Event::Apply(policy) => {
                let name = policy.name_any();
                self.cache.apply_generating_policy(policy);
                self.background.enqueue_policy(&name).await;
            }
            watcher::Event::InitApply(policy) => self.cache.apply_generating_policy(policy),
            watcher::Event::Delete(policy) => {
                let name = policy.name_any();
                self.cache.remove_generating_policy(&name);
                self.background.enqueue_policy(&name).await;
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

/// Start every watch as a detached task
pub fn spawn_watches(
    client: &Client,
    namespace: &str,
    index: &Arc<UpdateRequestIndex>,
    cache: &Arc<PolicyCache>,
    background: &Arc<BackgroundController>,
    cleanup: &Arc<CleanupController>,
) -> Vec<JoinHandle<()>> {
    let urs = Arc::new(UpdateRequestEvents::new(
        Arc::clone(index),
        Arc::clone(background),
        Arc::clone(cleanup),
    ));
    let policies = Arc::new(PolicyEvents::new(
        Arc::clone(cache),
        Arc::clone(background),
        Arc::clone(cleanup),
    ));
    let generating = Arc::new(GeneratingPolicyEvents::new(
        Arc::clone(cache),
        Arc::clone(background),
    ));

    vec![
        tokio::spawn(watch_forever(
            "updaterequests",
            Api::<UpdateRequest>::namespaced(client.clone(), namespace),
            urs,
        )),
        tokio::spawn(watch_forever(
            "clusterpolicies",
            Api::<ClusterPolicy>::all(client.clone()),
            Arc::clone(&policies),
        )),
        tokio::spawn(watch_forever(
            "policies",
            Api::<Policy>::all(client.clone()),
            policies,
        )),
        tokio::spawn(watch_forever(
            "generatingpolicies",
            Api::<GeneratingPolicy>::all(client.clone()),
            generating,
        )),
    ]
}
