//! # In-Memory Cluster
//!
//! A single-process stand-in for the API server implementing every client trait.
//!
//! It keeps the semantics the controllers rely on:
//! - resourceVersion compare-and-swap on updates (409 Conflict when stale)
//! - status as a separate subresource (spec writes keep status, status writes keep spec)
//! - server-assigned names for `generateName`
//! - finalizers holding back deletion
//!
//! Faults can be injected for the next read of a UR to exercise transient-error paths.
//! Every UR operation yields to the scheduler before touching state, so concurrent
//! callers interleave at the same points they would against a real API server.

use super::{object_identity, PolicyClient, ResourceClient, UpdateRequestStore};
use crate::crd::{
    parse_policy_key, AnyPolicy, ClusterPolicy, GeneratingPolicy, Policy, ResourceSpec,
    UpdateRequest,
};
use crate::labels::{parse_selector, selector_matches, Labels};
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ObjectKey = (String, String, String, String);

fn object_key(spec: &ResourceSpec) -> ObjectKey {
    (
        spec.api_version.clone(),
        spec.kind.clone(),
        spec.namespace.clone(),
        spec.name.clone(),
    )
}

#[derive(Debug, Default)]
struct MemoryState {
    next_version: u64,
    next_name: u64,
    update_requests: BTreeMap<String, UpdateRequest>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    cluster_policies: HashMap<String, ClusterPolicy>,
    policies: HashMap<String, Policy>,
    generating_policies: HashMap<String, GeneratingPolicy>,
    get_faults: HashMap<String, (u16, String)>,
    status_writes: u64,
    journal: Vec<String>,
}

impl MemoryState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn record(&mut self, verb: &str, kind: &str, name: &str) {
        self.journal.push(format!("{verb} {kind}/{name}"));
    }
}

/// In-memory cluster with optimistic concurrency
#[derive(Debug)]
pub struct InMemoryCluster {
    namespace: String,
    state: Mutex<MemoryState>,
}

fn deletion_timestamp() -> Option<Time> {
    serde_json::from_value(serde_json::json!(chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
    .ok()
}

impl InMemoryCluster {
    /// Cluster whose URs live in `namespace`
    pub fn new(namespace: &str) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.to_string(),
            state: Mutex::new(MemoryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a UR as-is, status included
    pub fn insert_update_request(&self, mut ur: UpdateRequest) -> UpdateRequest {
        let mut state = self.lock();
        ur.metadata.namespace = Some(self.namespace.clone());
        ur.metadata.resource_version = Some(state.bump());
        state
            .update_requests
            .insert(ur.name_any(), ur.clone());
        ur
    }

    pub fn update_request(&self, name: &str) -> Option<UpdateRequest> {
        self.lock().update_requests.get(name).cloned()
    }

    pub fn update_requests(&self) -> Vec<UpdateRequest> {
        self.lock().update_requests.values().cloned().collect()
    }

    /// Number of status subresource writes so far
    pub fn status_writes(&self) -> u64 {
        self.lock().status_writes
    }

    /// Client writes in the order they landed, as `"<verb> <kind>/<name>"`
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Fail the next `get` of the named UR with the given API status
    pub fn fail_next_get(&self, name: &str, code: u16, message: &str) {
        self.lock()
            .get_faults
            .insert(name.to_string(), (code, message.to_string()));
    }

    /// Store an arbitrary object given as JSON
    pub fn insert_object(&self, value: serde_json::Value) -> Result<DynamicObject> {
        let mut obj: DynamicObject = serde_json::from_value(value)?;
        let mut state = self.lock();
        obj.metadata.resource_version = Some(state.bump());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        state
            .objects
            .insert(object_key(&object_identity(&obj)), obj.clone());
        Ok(obj)
    }

    pub fn object(&self, target: &ResourceSpec) -> Option<DynamicObject> {
        self.lock().objects.get(&object_key(target)).cloned()
    }

    pub fn remove_object(&self, target: &ResourceSpec) -> Option<DynamicObject> {
        self.lock().objects.remove(&object_key(target))
    }

    pub fn objects_of_kind(&self, kind: &str) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((_, k, _, _), _)| k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn insert_cluster_policy(&self, policy: ClusterPolicy) {
        let mut state = self.lock();
        let mut policy = policy;
        policy.metadata.resource_version = Some(state.bump());
        state.cluster_policies.insert(policy.name_any(), policy);
    }

    pub fn insert_policy(&self, policy: Policy) {
        let mut state = self.lock();
        let mut policy = policy;
        policy.metadata.resource_version = Some(state.bump());
        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
        state.policies.insert(key, policy);
    }

    pub fn insert_generating_policy(&self, policy: GeneratingPolicy) {
        self.lock()
            .generating_policies
            .insert(policy.name_any(), policy);
    }

    pub fn cluster_policy(&self, name: &str) -> Option<ClusterPolicy> {
        self.lock().cluster_policies.get(name).cloned()
    }

    /// Delete a cluster policy; with finalizers present only the deletion timestamp is set
    pub fn delete_cluster_policy(&self, name: &str) {
        let mut state = self.lock();
        let Some(policy) = state.cluster_policies.get_mut(name) else {
            return;
        };
        if policy.finalizers().is_empty() {
            state.cluster_policies.remove(name);
        } else {
            policy.metadata.deletion_timestamp = deletion_timestamp();
        }
    }
}

#[async_trait]
impl UpdateRequestStore for InMemoryCluster {
    async fn get(&self, name: &str) -> Result<UpdateRequest> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if let Some((code, message)) = state.get_faults.remove(name) {
            return Err(Error::Api { code, message });
        }
        state
            .update_requests
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("UpdateRequest", name))
    }

    async fn list(&self, selector: &Labels) -> Result<Vec<UpdateRequest>> {
        tokio::task::yield_now().await;
        Ok(self
            .lock()
            .update_requests
            .values()
            .filter(|ur| {
                ur.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| selector_matches(selector, labels))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let mut created = ur.clone();
        let name = match (&ur.metadata.name, &ur.metadata.generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => {
                state.next_name += 1;
                format!("{prefix}{:05}", state.next_name)
            }
            _ => return Err(Error::Api {
                code: 422,
                message: "name or generateName is required".to_string(),
            }),
        };
        if state.update_requests.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "UpdateRequest".to_string(),
                name,
            });
        }
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.bump());
        created.status = None;
        state.record("create", "UpdateRequest", &name);
        state.update_requests.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        tokio::task::yield_now().await;
        let name = ur.name_any();
        let mut state = self.lock();
        let current = state
            .update_requests
            .get(&name)
            .ok_or_else(|| Error::not_found("UpdateRequest", &name))?;
        if current.metadata.resource_version != ur.metadata.resource_version {
            return Err(Error::conflict(
                "UpdateRequest",
                &name,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }
        let mut updated = ur.clone();
        updated.status = current.status.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.record("update", "UpdateRequest", &name);
        state.update_requests.insert(name, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        tokio::task::yield_now().await;
        let name = ur.name_any();
        let mut state = self.lock();
        let current = state
            .update_requests
            .get(&name)
            .ok_or_else(|| Error::not_found("UpdateRequest", &name))?;
        if current.metadata.resource_version != ur.metadata.resource_version {
            return Err(Error::conflict(
                "UpdateRequest",
                &name,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }
        let mut updated = current.clone();
        updated.status = ur.status.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.status_writes += 1;
        state.record("update-status", "UpdateRequest", &name);
        state.update_requests.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state
            .update_requests
            .remove(name)
            .ok_or_else(|| Error::not_found("UpdateRequest", name))?;
        state.record("delete", "UpdateRequest", name);
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for InMemoryCluster {
    async fn get(&self, target: &ResourceSpec) -> Result<DynamicObject> {
        self.object(target)
            .ok_or_else(|| Error::not_found(&target.kind, target.to_string()))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let selector = selector.map(parse_selector).unwrap_or_default();
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((v, k, ns, _), _)| {
                v == api_version && k == kind && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, obj)| obj)
            .filter(|obj| {
                let labels = obj.metadata.labels.clone().unwrap_or_default();
                selector_matches(&selector, &labels)
            })
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let identity = object_identity(obj);
        let key = object_key(&identity);
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: identity.kind.clone(),
                name: identity.to_string(),
            });
        }
        let mut created = obj.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.bump());
        state.record("create", &identity.kind, &identity.name);
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let identity = object_identity(obj);
        let key = object_key(&identity);
        let mut state = self.lock();
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found(&identity.kind, identity.to_string()))?;
        if obj.metadata.resource_version.is_some()
            && current.metadata.resource_version != obj.metadata.resource_version
        {
            return Err(Error::conflict(
                &identity.kind,
                identity.to_string(),
                "the object has been modified",
            ));
        }
        let mut updated = obj.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.record("update", &identity.kind, &identity.name);
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, target: &ResourceSpec) -> Result<()> {
        let mut state = self.lock();
        state
            .objects
            .remove(&object_key(target))
            .ok_or_else(|| Error::not_found(&target.kind, target.to_string()))?;
        state.record("delete", &target.kind, &target.name);
        Ok(())
    }
}

#[async_trait]
impl PolicyClient for InMemoryCluster {
    async fn get_policy(&self, key: &str) -> Result<AnyPolicy> {
        let (namespace, name) = parse_policy_key(key)?;
        let state = self.lock();
        match namespace {
            None => state
                .cluster_policies
                .get(name)
                .cloned()
                .map(|p| AnyPolicy::Cluster(Arc::new(p))),
            Some(_) => state
                .policies
                .get(key)
                .cloned()
                .map(|p| AnyPolicy::Namespaced(Arc::new(p))),
        }
        .ok_or_else(|| Error::not_found("Policy", key))
    }

    async fn get_generating_policy(&self, name: &str) -> Result<Arc<GeneratingPolicy>> {
        self.lock()
            .generating_policies
            .get(name)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| Error::not_found("GeneratingPolicy", name))
    }

    async fn set_finalizers(&self, policy: &AnyPolicy, finalizers: Vec<String>) -> Result<()> {
        let key = policy.key();
        let mut state = self.lock();
        let version = state.bump();
        match policy {
            AnyPolicy::Cluster(_) => {
                let stored = state
                    .cluster_policies
                    .get_mut(&key)
                    .ok_or_else(|| Error::not_found("ClusterPolicy", &key))?;
                stored.metadata.finalizers = Some(finalizers);
                stored.metadata.resource_version = Some(version);
                if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
                    state.cluster_policies.remove(&key);
                }
            }
            AnyPolicy::Namespaced(_) => {
                let stored = state
                    .policies
                    .get_mut(&key)
                    .ok_or_else(|| Error::not_found("Policy", &key))?;
                stored.metadata.finalizers = Some(finalizers);
                stored.metadata.resource_version = Some(version);
                if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
                    state.policies.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RequestType, UpdateRequestSpec, UpdateRequestStatus, UrState};

    fn new_ur() -> UpdateRequest {
        let mut ur = UpdateRequest::new(
            "",
            UpdateRequestSpec {
                request_type: RequestType::Generate,
                policy: "p".to_string(),
                ..Default::default()
            },
        );
        ur.metadata.name = None;
        ur.metadata.generate_name = Some("ur-".to_string());
        ur
    }

    #[tokio::test]
    async fn test_create_assigns_name_and_drops_status() {
        let cluster = InMemoryCluster::new("kyverno");
        let mut ur = new_ur();
        ur.status = Some(UpdateRequestStatus {
            state: Some(UrState::Completed),
            ..Default::default()
        });
        let created = UpdateRequestStore::create(cluster.as_ref(), &ur).await.unwrap();
        assert_eq!(created.name_any(), "ur-00001");
        assert!(created.status.is_none());
        assert_eq!(created.namespace().as_deref(), Some("kyverno"));
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let cluster = InMemoryCluster::new("kyverno");
        let created = UpdateRequestStore::create(cluster.as_ref(), &new_ur()).await.unwrap();

        let mut first = created.clone();
        first.status = Some(UpdateRequestStatus {
            handler: "a".to_string(),
            ..Default::default()
        });
        cluster.update_status(&first).await.unwrap();

        let mut second = created;
        second.status = Some(UpdateRequestStatus {
            handler: "b".to_string(),
            ..Default::default()
        });
        let err = cluster.update_status(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.update_request("ur-00001").unwrap().handler(), "a");
    }

    #[tokio::test]
    async fn test_spec_update_keeps_status() {
        let cluster = InMemoryCluster::new("kyverno");
        let created = UpdateRequestStore::create(cluster.as_ref(), &new_ur()).await.unwrap();
        let mut with_status = created.clone();
        with_status.status = Some(UpdateRequestStatus {
            state: Some(UrState::Pending),
            ..Default::default()
        });
        let current = cluster.update_status(&with_status).await.unwrap();

        let mut edited = current;
        edited.spec.policy = "q".to_string();
        edited.status = None;
        let updated = UpdateRequestStore::update(cluster.as_ref(), &edited).await.unwrap();
        assert_eq!(updated.spec.policy, "q");
        assert_eq!(updated.state(), Some(UrState::Pending));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let cluster = InMemoryCluster::new("kyverno");
        UpdateRequestStore::create(cluster.as_ref(), &new_ur()).await.unwrap();
        cluster.fail_next_get("ur-00001", 503, "etcd timeout");
        let err = UpdateRequestStore::get(cluster.as_ref(), "ur-00001").await.unwrap_err();
        assert!(err.is_transient());
        assert!(UpdateRequestStore::get(cluster.as_ref(), "ur-00001").await.is_ok());
    }

    #[tokio::test]
    async fn test_objects_list_by_selector() {
        let cluster = InMemoryCluster::new("kyverno");
        cluster
            .insert_object(serde_json::json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "a", "namespace": "team-a", "labels": {"app": "x"}}
            }))
            .unwrap();
        cluster
            .insert_object(serde_json::json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "b", "namespace": "team-a"}
            }))
            .unwrap();
        let all = ResourceClient::list(cluster.as_ref(), "v1", "ConfigMap", "team-a", None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let selected =
            ResourceClient::list(cluster.as_ref(), "v1", "ConfigMap", "", Some("app=x"))
                .await
                .unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn test_finalizer_holds_back_policy_deletion() {
        let cluster = InMemoryCluster::new("kyverno");
        let mut policy = ClusterPolicy::new("p", Default::default());
        policy.metadata.finalizers = Some(vec!["f".to_string()]);
        cluster.insert_cluster_policy(policy);

        cluster.delete_cluster_policy("p");
        let deleting = cluster.get_policy("p").await.unwrap();
        assert!(deleting.is_deleting());

        cluster.set_finalizers(&deleting, vec![]).await.unwrap();
        assert!(cluster.cluster_policy("p").is_none());
    }
}
