//! # UpdateRequest Generator
//!
//! Turns a decided rule intent into exactly one live UR per dedup key.
//!
//! Production is two sequential writes because status is a separate
//! subresource:
//!
//! 1. **create-or-update**: find the UR by its dedup labels and replace its
//!    spec, or create one with a server-assigned name
//! 2. **set pending**: reset `status.state` to Pending and clear the message
//!
//! Each phase has its own time-bounded retry. [`Generator::apply`] runs both in a
//! detached task so the admission handler never waits on it.

use crate::client::UpdateRequestStore;
use crate::constants::UPDATE_REQUEST_GENERATE_NAME;
use crate::controller::backoff::BoundedBackoff;
use crate::controller::updater;
use crate::crd::{RequestType, ResourceSpec, UpdateRequest, UpdateRequestSpec};
use crate::labels::DedupKey;
use crate::observability::metrics;
use crate::Result;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Level};

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created(String),
    Updated(String),
    /// Nothing to do for this intent
    Skipped,
}

impl Applied {
    pub fn name(&self) -> Option<&str> {
        match self {
            Applied::Created(name) | Applied::Updated(name) => Some(name),
            Applied::Skipped => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Applied::Created(_) => "created",
            Applied::Updated(_) => "updated",
            Applied::Skipped => "skipped",
        }
    }
}

/// Admission-time UR producer
pub struct Generator {
    store: Arc<dyn UpdateRequestStore>,
    namespace: String,
    backoff: BoundedBackoff,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("namespace", &self.namespace)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Trigger used for the dedup key: the first rule's, else the legacy resource
fn dedup_trigger(spec: &UpdateRequestSpec) -> Option<&ResourceSpec> {
    spec.rule_context
        .first()
        .map(|rc| &rc.trigger)
        .or(spec.resource.as_ref())
}

impl Generator {
    pub fn new(
        store: Arc<dyn UpdateRequestStore>,
        namespace: &str,
        backoff: BoundedBackoff,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: namespace.to_string(),
            backoff,
        })
    }

    /// Fire-and-forget: produce the UR in a detached task
    pub fn apply(self: &Arc<Self>, spec: UpdateRequestSpec) -> JoinHandle<()> {
        let generator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = generator.apply_and_wait(spec).await {
                error!(error = %e, "❌ giving up on update request after retry budget");
            }
        })
    }

    /// Produce the UR and wait for both phases
    pub async fn apply_and_wait(&self, spec: UpdateRequestSpec) -> Result<Applied> {
        let span = tracing::span!(
            Level::INFO,
            "controller.generator.apply",
            policy = %spec.policy,
            request_type = %spec.request_type
        );
        self.produce(spec).instrument(span).await
    }

    async fn produce(&self, spec: UpdateRequestSpec) -> Result<Applied> {
        if spec.request_type == RequestType::Mutate && spec.rule_context.is_empty() {
            debug!("mutate intent without rules, nothing to queue");
            metrics::increment_generator_apply(Applied::Skipped.as_str());
            return Ok(Applied::Skipped);
        }

        let key = DedupKey::new(spec.request_type, &spec.policy, dedup_trigger(&spec));
        let result = async {
            let applied = self
                .backoff
                .retry("create-or-update", || self.create_or_update(&spec, &key))
                .await?;
            if let Some(name) = applied.name() {
                self.backoff
                    .retry("set-pending", || updater::mark_pending(self.store.as_ref(), name))
                    .await?;
            }
            Ok(applied)
        }
        .await;

        match &result {
            Ok(applied) => {
                info!(
                    ur.name = applied.name().unwrap_or_default(),
                    outcome = applied.as_str(),
                    "update request queued"
                );
                metrics::increment_generator_apply(applied.as_str());
            }
            Err(_) => metrics::increment_generator_apply("failed"),
        }
        result
    }

    async fn create_or_update(&self, spec: &UpdateRequestSpec, key: &DedupKey) -> Result<Applied> {
        let labels = key.labels();
        let mut existing: Vec<UpdateRequest> = self
            .store
            .list(&labels)
            .await?
            .into_iter()
            .filter(|ur| ur.spec.request_type == spec.request_type)
            .collect();
        existing.sort_by_key(ResourceExt::name_any);

        let mut candidates = existing.into_iter();
        let Some(mut ur) = candidates.next() else {
            let mut ur = UpdateRequest::new("", spec.clone());
            ur.metadata.name = None;
            ur.metadata.generate_name = Some(UPDATE_REQUEST_GENERATE_NAME.to_string());
            ur.metadata.namespace = Some(self.namespace.clone());
            ur.metadata.labels = Some(labels);
            let created = self.store.create(&ur).await?;
            return Ok(Applied::Created(created.name_any()));
        };

        for duplicate in candidates {
            let name = duplicate.name_any();
            warn!(ur.name = %name, "deleting duplicate update request");
            match self.store.delete(&name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        ur.spec.policy.clone_from(&spec.policy);
        ur.spec.resource.clone_from(&spec.resource);
        ur.spec.rule_context.clone_from(&spec.rule_context);
        ur.spec.context.clone_from(&spec.context);
        ur.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
        let updated = self.store.update(&ur).await?;
        Ok(Applied::Updated(updated.name_any()))
    }
}
