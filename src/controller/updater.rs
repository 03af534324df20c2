//! # UpdateRequest Writers
//!
//! Status transitions and annotation bumps. Every write re-reads the record and
//! is retried on conflict, so callers never act on a stale resourceVersion.

use crate::client::UpdateRequestStore;
use crate::controller::backoff::retry_on_conflict;
use crate::crd::{ResourceSpec, UpdateRequest, UpdateRequestStatus, UrState};
use crate::labels::{RETRY_COUNT_ANNOTATION, UPDATION_TIME_ANNOTATION};
use crate::{Error, Result};
use chrono::SecondsFormat;
use std::collections::BTreeMap;
use tracing::debug;

/// Apply `change` to a fresh copy of the status and write it back
pub async fn update_status<F>(
    store: &dyn UpdateRequestStore,
    name: &str,
    change: F,
) -> Result<UpdateRequest>
where
    F: Fn(&mut UpdateRequestStatus) + Send + Sync,
{
    retry_on_conflict(|| async {
        let mut ur = store.get(name).await?;
        change(ur.status.get_or_insert_with(UpdateRequestStatus::default));
        store.update_status(&ur).await
    })
    .await
}

/// Pending with an empty message; handler and generated resources are kept
pub async fn mark_pending(store: &dyn UpdateRequestStore, name: &str) -> Result<UpdateRequest> {
    update_status(store, name, |status| {
        status.state = Some(UrState::Pending);
        status.message.clear();
    })
    .await
}

pub async fn mark_completed(
    store: &dyn UpdateRequestStore,
    name: &str,
    generated: &[ResourceSpec],
) -> Result<UpdateRequest> {
    update_status(store, name, |status| {
        status.state = Some(UrState::Completed);
        status.message.clear();
        status.generated_resources = generated.to_vec();
    })
    .await
}

pub async fn mark_failed(
    store: &dyn UpdateRequestStore,
    name: &str,
    message: &str,
    generated: &[ResourceSpec],
) -> Result<UpdateRequest> {
    update_status(store, name, |status| {
        status.state = Some(UrState::Failed);
        status.message = message.to_string();
        status.generated_resources = generated.to_vec();
    })
    .await
}

pub async fn mark_skipped(store: &dyn UpdateRequestStore, name: &str) -> Result<UpdateRequest> {
    update_status(store, name, |status| {
        status.state = Some(UrState::Skip);
        status.message.clear();
    })
    .await
}

/// Force re-reconciliation: stamp the updation time and reset to Pending
pub async fn bump(store: &dyn UpdateRequestStore, name: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    retry_on_conflict(|| async {
        let mut ur = store.get(name).await?;
        ur.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(UPDATION_TIME_ANNOTATION.to_string(), now.clone());
        store.update(&ur).await
    })
    .await?;
    mark_pending(store, name).await?;
    debug!(ur.name = name, "bumped update request");
    Ok(())
}

/// Orphan retry count; a missing annotation counts as zero
pub fn retry_count(ur: &UpdateRequest) -> Result<u32> {
    match ur.annotation(RETRY_COUNT_ANNOTATION) {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .ok()
            .ok_or_else(|| Error::InvalidAnnotation {
                key: RETRY_COUNT_ANNOTATION.to_string(),
                value: value.to_string(),
            }),
    }
}

/// Increment the orphan retry count, returning the new value
pub async fn increment_retry_count(store: &dyn UpdateRequestStore, name: &str) -> Result<u32> {
    retry_on_conflict(|| async {
        let mut ur = store.get(name).await?;
        let count = retry_count(&ur)?.saturating_add(1);
        ur.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(RETRY_COUNT_ANNOTATION.to_string(), count.to_string());
        store.update(&ur).await?;
        Ok(count)
    })
    .await
}

/// Merge two resource lists, keeping the first occurrence of each object
pub fn merge_resources(existing: &[ResourceSpec], added: &[ResourceSpec]) -> Vec<ResourceSpec> {
    let mut merged: Vec<ResourceSpec> = Vec::with_capacity(existing.len() + added.len());
    for resource in existing.iter().chain(added) {
        if !merged.iter().any(|r| r.same_object(resource)) {
            merged.push(resource.clone());
        }
    }
    merged
}
