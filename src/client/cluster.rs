//! # Kubernetes-Backed Clients
//!
//! Implements the client traits against a live API server.
//!
//! UR reads by name go to the API server so transient failures surface as errors
//! instead of stale cache hits. Label lookups are answered from the watch-fed
//! [`UpdateRequestIndex`]. Policies are served from the watch-fed [`PolicyCache`].
//! Arbitrary objects are accessed through discovery and `DynamicObject`.

use super::cache::{PolicyCache, UpdateRequestIndex};
use super::{object_identity, PolicyClient, ResourceClient, UpdateRequestStore};
use crate::constants::CONTROLLER_NAME;
use crate::crd::{
    parse_policy_key, AnyPolicy, ClusterPolicy, GeneratingPolicy, Policy, ResourceSpec,
    UpdateRequest,
};
use crate::labels::Labels;
use crate::{Error, Result};
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::{ApiCapabilities, Discovery, Scope};
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Resolved = (ApiResource, ApiCapabilities);

/// Client set for a live cluster
pub struct KubeCluster {
    client: Client,
    namespace: String,
    index: Arc<UpdateRequestIndex>,
    policies: Arc<PolicyCache>,
    resources: RwLock<HashMap<(String, String), Resolved>>,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("namespace", &self.namespace)
            .field("cached_urs", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(
        client: Client,
        namespace: &str,
        index: Arc<UpdateRequestIndex>,
        policies: Arc<PolicyCache>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            index,
            policies,
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn update_requests(&self) -> Api<UpdateRequest> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Resolve a kind to its API resource, running full discovery when the version is unknown
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Resolved> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.resources.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let resolved = if api_version.is_empty() {
            let discovery = Discovery::new(self.client.clone())
                .run()
                .await
                .map_err(|e| Error::from_kube(e, "APIResource", kind))?;
            let found = discovery
                .groups()
                .flat_map(|group| group.recommended_resources())
                .find(|(ar, _)| ar.kind == kind);
            found.ok_or_else(|| Error::not_found("APIResource", kind))?
        } else {
            let (group, version) = api_version
                .split_once('/')
                .unwrap_or(("", api_version));
            let gvk = kube::core::GroupVersionKind::gvk(group, version, kind);
            kube::discovery::pinned_kind(&self.client, &gvk)
                .await
                .map_err(|e| Error::from_kube(e, "APIResource", &format!("{api_version}/{kind}")))?
        };

        debug!(api_version, kind, plural = %resolved.0.plural, "resolved API resource");
        self.resources
            .write()
            .await
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        let (ar, caps) = self.resolve(api_version, kind).await?;
        Ok(match caps.scope {
            Scope::Namespaced if !namespace.is_empty() => {
                Api::namespaced_with(self.client.clone(), namespace, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl UpdateRequestStore for KubeCluster {
    async fn get(&self, name: &str) -> Result<UpdateRequest> {
        self.update_requests()
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, "UpdateRequest", name))
    }

    async fn list(&self, selector: &Labels) -> Result<Vec<UpdateRequest>> {
        Ok(self
            .index
            .list(selector)
            .into_iter()
            .map(Arc::unwrap_or_clone)
            .collect())
    }

    async fn create(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        let created = self
            .update_requests()
            .create(&PostParams::default(), ur)
            .await
            .map_err(|e| Error::from_kube(e, "UpdateRequest", &ur.name_any()))?;
        self.index.apply(&created);
        Ok(created)
    }

    async fn update(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        let name = ur.name_any();
        let updated = self
            .update_requests()
            .replace(&name, &PostParams::default(), ur)
            .await
            .map_err(|e| Error::from_kube(e, "UpdateRequest", &name))?;
        self.index.apply(&updated);
        Ok(updated)
    }

    async fn update_status(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        let name = ur.name_any();
        let updated = self
            .update_requests()
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(ur)?)
            .await
            .map_err(|e| Error::from_kube(e, "UpdateRequest", &name))?;
        self.index.apply(&updated);
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.update_requests()
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| Error::from_kube(e, "UpdateRequest", name))?;
        self.index.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for KubeCluster {
    async fn get(&self, target: &ResourceSpec) -> Result<DynamicObject> {
        let api = self
            .dynamic_api(&target.api_version, &target.kind, &target.namespace)
            .await?;
        api.get(&target.name)
            .await
            .map_err(|e| Error::from_kube(e, &target.kind, &target.to_string()))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        Ok(api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, kind, namespace))?
            .items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let identity = object_identity(obj);
        let api = self
            .dynamic_api(&identity.api_version, &identity.kind, &identity.namespace)
            .await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &identity.kind, &identity.to_string()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let identity = object_identity(obj);
        let api = self
            .dynamic_api(&identity.api_version, &identity.kind, &identity.namespace)
            .await?;
        api.replace(&identity.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &identity.kind, &identity.to_string()))
    }

    async fn delete(&self, target: &ResourceSpec) -> Result<()> {
        let api = self
            .dynamic_api(&target.api_version, &target.kind, &target.namespace)
            .await?;
        api.delete(&target.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, &target.kind, &target.to_string()))
    }
}

#[async_trait]
impl PolicyClient for KubeCluster {
    async fn get_policy(&self, key: &str) -> Result<AnyPolicy> {
        parse_policy_key(key)?;
        self.policies
            .get(key)
            .ok_or_else(|| Error::not_found("Policy", key))
    }

    async fn get_generating_policy(&self, name: &str) -> Result<Arc<GeneratingPolicy>> {
        self.policies
            .get_generating(name)
            .ok_or_else(|| Error::not_found("GeneratingPolicy", name))
    }

    async fn set_finalizers(&self, policy: &AnyPolicy, finalizers: Vec<String>) -> Result<()> {
        // resourceVersion in a merge patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": policy.meta().resource_version,
            }
        });
        let params = PatchParams::apply(CONTROLLER_NAME);
        let name = policy.name();
        match policy {
            AnyPolicy::Cluster(_) => {
                let api: Api<ClusterPolicy> = Api::all(self.client.clone());
                api.patch(&name, &params, &Patch::Merge(patch))
                    .await
                    .map_err(|e| Error::from_kube(e, "ClusterPolicy", &name))?;
            }
            AnyPolicy::Namespaced(_) => {
                let api: Api<Policy> = Api::namespaced(self.client.clone(), &policy.namespace());
                api.patch(&name, &params, &Patch::Merge(patch))
                    .await
                    .map_err(|e| Error::from_kube(e, "Policy", &policy.key()))?;
            }
        }
        Ok(())
    }
}
