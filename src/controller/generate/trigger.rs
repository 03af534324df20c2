//! # Trigger Resolution
//!
//! Where the trigger of a generate rule comes from depends on the admission
//! operation recorded with the UR:
//!
//! - **DELETE**: the old object from the snapshot, unless it is itself a
//!   generated resource, in which case the live trigger is fetched
//! - **UPDATE**: the new object from the snapshot
//! - **CREATE** or none: the live object, falling back to the snapshot for
//!   subresource requests

use crate::client::{Clients, ResourceClient};
use crate::controller::generate::downstream;
use crate::controller::updater;
use crate::crd::{Operation, ResourceSpec, UpdateRequest};
use crate::labels::{DOWNSTREAM_POLICY_NAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::observability::metrics;
use crate::{Error, Result};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, warn};

fn is_generated(object: &Value) -> bool {
    let label = |key: &str| {
        object
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    };
    label(MANAGED_BY_LABEL) == Some(MANAGED_BY_VALUE)
        && label(DOWNSTREAM_POLICY_NAME_LABEL).is_some()
}

async fn fetch(resources: &dyn ResourceClient, trigger: &ResourceSpec) -> Result<Option<Value>> {
    match resources.get(trigger).await {
        Ok(obj) => Ok(Some(serde_json::to_value(&obj)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// The trigger object for one rule context, `None` when it does not exist
pub async fn load(
    resources: &dyn ResourceClient,
    ur: &UpdateRequest,
    trigger: &ResourceSpec,
) -> Result<Option<Value>> {
    let snapshot = ur
        .spec
        .context
        .admission_request_info
        .admission_request
        .as_ref();
    match ur.operation() {
        Some(Operation::Delete) => {
            if let Some(old) = snapshot
                .and_then(|s| s.old_object.as_ref())
                .filter(|old| !is_generated(old))
            {
                return Ok(Some(old.clone()));
            }
            fetch(resources, trigger).await
        }
        Some(Operation::Update) => match snapshot.and_then(|s| s.object.as_ref()) {
            Some(object) => Ok(Some(object.clone())),
            None => fetch(resources, trigger).await,
        },
        _ => match fetch(resources, trigger).await? {
            Some(object) => Ok(Some(object)),
            None => Ok(snapshot
                .filter(|s| !s.sub_resource.is_empty())
                .and_then(|s| s.object.clone())),
        },
    }
}

/// Count one more miss; past the threshold remove the UR and what it generated
pub async fn handle_missing(
    clients: &Clients,
    ur: &UpdateRequest,
    trigger: &ResourceSpec,
    threshold: u32,
) -> Result<()> {
    let name = ur.name_any();
    let count = updater::increment_retry_count(clients.urs.as_ref(), &name).await?;
    if count <= threshold {
        debug!(ur.name = %name, %trigger, retry_count = count, "trigger not found yet");
        return Err(Error::TriggerNotReady(trigger.to_string()));
    }

    warn!(
        ur.name = %name,
        %trigger,
        retry_count = count,
        "trigger still missing, removing update request"
    );
    downstream::delete_all(clients.resources.as_ref(), ur.generated_resources(), "orphaned").await?;
    match clients.urs.delete(&name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    metrics::increment_update_requests_deleted("orphaned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::crd::{
        AdmissionRequestInfo, AdmissionRequestSnapshot, GroupVersionKind, UpdateRequestContext,
        UpdateRequestSpec,
    };
    use serde_json::json;

    fn ur(
        operation: Option<Operation>,
        object: Option<Value>,
        old_object: Option<Value>,
    ) -> UpdateRequest {
        let snapshot = operation.map(|operation| AdmissionRequestSnapshot {
            uid: "req-1".to_string(),
            kind: GroupVersionKind {
                group: String::new(),
                version: "v1".to_string(),
                kind: "Namespace".to_string(),
            },
            namespace: String::new(),
            name: "team-a".to_string(),
            operation,
            sub_resource: String::new(),
            dry_run: false,
            object,
            old_object,
        });
        UpdateRequest::new(
            "ur-1",
            UpdateRequestSpec {
                policy: "p".to_string(),
                context: UpdateRequestContext {
                    admission_request_info: AdmissionRequestInfo {
                        admission_request: snapshot,
                        operation,
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn namespace() -> Value {
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team-a"}})
    }

    fn trigger() -> ResourceSpec {
        ResourceSpec::new("v1", "Namespace", "", "team-a")
    }

    #[tokio::test]
    async fn test_delete_uses_old_object() {
        let cluster = InMemoryCluster::new("kyverno");
        let ur = ur(Some(Operation::Delete), None, Some(namespace()));
        let loaded = load(cluster.as_ref(), &ur, &trigger()).await.unwrap();
        assert_eq!(loaded, Some(namespace()));
    }

    #[tokio::test]
    async fn test_delete_of_generated_object_fetches_live_trigger() {
        let cluster = InMemoryCluster::new("kyverno");
        let generated = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "team-a", "labels": {
                (MANAGED_BY_LABEL): MANAGED_BY_VALUE,
                (DOWNSTREAM_POLICY_NAME_LABEL): "p"
            }}
        });
        let ur = ur(Some(Operation::Delete), None, Some(generated));
        assert_eq!(load(cluster.as_ref(), &ur, &trigger()).await.unwrap(), None);

        cluster.insert_object(namespace()).unwrap();
        let loaded = load(cluster.as_ref(), &ur, &trigger()).await.unwrap().unwrap();
        assert_eq!(loaded["metadata"]["name"], "team-a");
    }

    #[tokio::test]
    async fn test_create_fetches_live_object() {
        let cluster = InMemoryCluster::new("kyverno");
        let ur = ur(Some(Operation::Create), Some(namespace()), None);
        assert_eq!(load(cluster.as_ref(), &ur, &trigger()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_uses_snapshot() {
        let cluster = InMemoryCluster::new("kyverno");
        let ur = ur(Some(Operation::Update), Some(namespace()), None);
        assert_eq!(load(cluster.as_ref(), &ur, &trigger()).await.unwrap(), Some(namespace()));
    }
}
