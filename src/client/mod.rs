//! # Cluster Access
//!
//! Trait seams between the controllers and the Kubernetes API.
//!
//! - [`UpdateRequestStore`] reads and writes UR records with optimistic concurrency.
//! - [`ResourceClient`] reads and writes arbitrary objects (triggers, clone sources, downstream).
//! - [`PolicyClient`] resolves policies and manages the cleanup finalizer.
//!
//! `cluster` implements all three against a live cluster; `memory` implements
//! them in-process for tests.

pub mod cache;
pub mod cluster;
pub mod memory;

use crate::crd::{AnyPolicy, GeneratingPolicy, ResourceSpec, UpdateRequest};
use crate::labels::Labels;
use crate::Result;
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::sync::Arc;

#[async_trait]
pub trait UpdateRequestStore: Send + Sync {
    /// Fresh read, distinguishing `NotFound` from transient failures
    async fn get(&self, name: &str) -> Result<UpdateRequest>;

    /// URs whose labels contain every selector entry
    async fn list(&self, selector: &Labels) -> Result<Vec<UpdateRequest>>;

    /// Create with a server-assigned name; status is ignored
    async fn create(&self, ur: &UpdateRequest) -> Result<UpdateRequest>;

    /// Replace metadata and spec; fails with `Conflict` on a stale resourceVersion
    async fn update(&self, ur: &UpdateRequest) -> Result<UpdateRequest>;

    /// Replace the status subresource; fails with `Conflict` on a stale resourceVersion
    async fn update_status(&self, ur: &UpdateRequest) -> Result<UpdateRequest>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, target: &ResourceSpec) -> Result<DynamicObject>;

    /// List objects of a kind, optionally filtered by a `k=v,...` selector
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create from an object carrying its own apiVersion, kind and metadata
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; the resourceVersion in `obj` is enforced
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, target: &ResourceSpec) -> Result<()>;
}

#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Resolve a `name` or `namespace/name` key
    async fn get_policy(&self, key: &str) -> Result<AnyPolicy>;

    async fn get_generating_policy(&self, name: &str) -> Result<Arc<GeneratingPolicy>>;

    /// Replace the finalizer list of a policy
    async fn set_finalizers(&self, policy: &AnyPolicy, finalizers: Vec<String>) -> Result<()>;
}

/// The three client seams bundled for the controllers
#[derive(Clone)]
pub struct Clients {
    pub urs: Arc<dyn UpdateRequestStore>,
    pub resources: Arc<dyn ResourceClient>,
    pub policies: Arc<dyn PolicyClient>,
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}

impl Clients {
    /// Use one backend for every seam
    pub fn new<C>(cluster: &Arc<C>) -> Self
    where
        C: UpdateRequestStore + ResourceClient + PolicyClient + 'static,
    {
        let urs = Arc::clone(cluster) as Arc<dyn UpdateRequestStore>;
        let resources = Arc::clone(cluster) as Arc<dyn ResourceClient>;
        let policies = Arc::clone(cluster) as Arc<dyn PolicyClient>;
        Self {
            urs,
            resources,
            policies,
        }
    }
}

/// Identity of a dynamic object
pub fn object_identity(obj: &DynamicObject) -> ResourceSpec {
    ResourceSpec {
        api_version: obj
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .unwrap_or_default(),
        kind: obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        uid: obj.metadata.uid.clone().unwrap_or_default(),
    }
}

/// Labels of a dynamic object, empty when unset
pub fn object_labels(obj: &DynamicObject) -> Labels {
    obj.metadata.labels.clone().unwrap_or_default()
}
