//! # Watch-Fed Caches
//!
//! Local views of URs and policies maintained from watch streams.
//!
//! [`UpdateRequestIndex`] keeps an explicit dedup index so the generator and the
//! cleanup controller can find URs by `(type, policy, trigger)` without scanning
//! every record with a label selector.

use crate::crd::{AnyPolicy, ClusterPolicy, GeneratingPolicy, Policy, RequestType, UpdateRequest};
use crate::labels::{selector_matches, DedupKey, Labels};
use kube::ResourceExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct IndexState {
    by_name: HashMap<String, Arc<UpdateRequest>>,
    by_key: HashMap<DedupKey, BTreeSet<String>>,
    by_policy: HashMap<(RequestType, String), BTreeSet<String>>,
}

impl IndexState {
    // CEL generate URs share the generate label family and are indexed with them
    fn keys_for(ur: &UpdateRequest) -> Option<DedupKey> {
        let request_type = if ur.spec.request_type.is_generate() {
            RequestType::Generate
        } else {
            RequestType::Mutate
        };
        DedupKey::from_labels(ur.metadata.labels.as_ref()?, request_type)
    }

    fn unlink(&mut self, name: &str) {
        let Some(old) = self.by_name.remove(name) else {
            return;
        };
        if let Some(key) = Self::keys_for(&old) {
            let policy = (key.request_type, key.policy.clone());
            if let Some(names) = self.by_key.get_mut(&key) {
                names.remove(name);
                if names.is_empty() {
                    self.by_key.remove(&key);
                }
            }
            if let Some(names) = self.by_policy.get_mut(&policy) {
                names.remove(name);
                if names.is_empty() {
                    self.by_policy.remove(&policy);
                }
            }
        }
    }
}

/// Dedup index over UpdateRequests
#[derive(Debug, Default)]
pub struct UpdateRequestIndex {
    state: RwLock<IndexState>,
}

impl UpdateRequestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a UR from a watch event
    pub fn apply(&self, ur: &UpdateRequest) {
        let name = ur.name_any();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.unlink(&name);
        if let Some(key) = IndexState::keys_for(ur) {
            state
                .by_policy
                .entry((key.request_type, key.policy.clone()))
                .or_default()
                .insert(name.clone());
            if key.trigger.is_some() {
                state.by_key.entry(key).or_default().insert(name.clone());
            }
        }
        state.by_name.insert(name, Arc::new(ur.clone()));
    }

    pub fn remove(&self, name: &str) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unlink(name);
    }

    /// Drop everything, used when a watch restarts its initial list
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = IndexState::default();
    }

    pub fn get(&self, name: &str) -> Option<Arc<UpdateRequest>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
    }

    /// All URs whose labels contain `selector`, sorted by name
    pub fn list(&self, selector: &Labels) -> Vec<Arc<UpdateRequest>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<&String> = match Self::indexed_key(selector) {
            Some(key) if key.trigger.is_some() => state
                .by_key
                .get(&key)
                .map(|names| names.iter().collect())
                .unwrap_or_default(),
            Some(key) => state
                .by_policy
                .get(&(key.request_type, key.policy))
                .map(|names| names.iter().collect())
                .unwrap_or_default(),
            None => {
                let mut names: Vec<&String> = state.by_name.keys().collect();
                names.sort();
                names
            }
        };
        candidates
            .into_iter()
            .filter_map(|name| state.by_name.get(name))
            .filter(|ur| {
                ur.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| selector_matches(selector, labels))
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A selector that is exactly a dedup label set can use the index
    fn indexed_key(selector: &Labels) -> Option<DedupKey> {
        [RequestType::Mutate, RequestType::Generate]
            .into_iter()
            .filter_map(|t| DedupKey::from_labels(selector, t))
            .find(|key| key.labels() == *selector)
    }
}

/// Local view of policies, keyed the way `UpdateRequest.spec.policy` refers to them
#[derive(Debug, Default)]
pub struct PolicyCache {
    cluster: RwLock<HashMap<String, Arc<ClusterPolicy>>>,
    namespaced: RwLock<HashMap<String, Arc<Policy>>>,
    generating: RwLock<HashMap<String, Arc<GeneratingPolicy>>>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_cluster_policy(&self, policy: ClusterPolicy) {
        self.cluster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(policy.name_any(), Arc::new(policy));
    }

    pub fn remove_cluster_policy(&self, name: &str) {
        self.cluster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn apply_policy(&self, policy: Policy) {
        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
        self.namespaced
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(policy));
    }

    pub fn remove_policy(&self, key: &str) {
        self.namespaced
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn apply_generating_policy(&self, policy: GeneratingPolicy) {
        self.generating
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(policy.name_any(), Arc::new(policy));
    }

    pub fn remove_generating_policy(&self, name: &str) {
        self.generating
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn get(&self, key: &str) -> Option<AnyPolicy> {
        if key.contains('/') {
            self.namespaced
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
                .map(AnyPolicy::Namespaced)
        } else {
            self.cluster
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
                .map(AnyPolicy::Cluster)
        }
    }

    pub fn get_generating(&self, name: &str) -> Option<Arc<GeneratingPolicy>> {
        self.generating
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
