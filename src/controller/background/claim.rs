//! # Claims
//!
//! `status.handler` is the only mutual-exclusion primitive on a UR. Claiming is
//! a compare-and-swap on the record's resourceVersion: a worker writes its own
//! identity only while the handler is empty, and a stale write fails with
//! `Conflict` instead of overwriting another claim. Each claim is stamped with
//! the time it was taken so an abandoned one can be told apart from a live one.

use crate::client::UpdateRequestStore;
use crate::controller::backoff::retry_on_conflict;
use crate::crd::{UpdateRequest, UpdateRequestStatus};
use crate::Result;
use chrono::{SecondsFormat, Utc};
use std::time::Duration;
use tracing::debug;

/// Claim the UR for `instance`; `None` when another handler holds it
pub async fn acquire(
    store: &dyn UpdateRequestStore,
    name: &str,
    instance: &str,
) -> Result<Option<UpdateRequest>> {
    retry_on_conflict(|| async {
        let mut ur = store.get(name).await?;
        let handler = ur.handler().to_string();
        if handler == instance {
            return Ok(Some(ur));
        }
        if !handler.is_empty() {
            debug!(ur.name = name, %handler, "update request claimed by another handler");
            return Ok(None);
        }
        let status = ur.status.get_or_insert_with(UpdateRequestStatus::default);
        status.handler = instance.to_string();
        status.claimed_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        store.update_status(&ur).await.map(Some)
    })
    .await
}

/// Clear the claim if `holder` still owns it; a deleted UR counts as released
pub async fn release(store: &dyn UpdateRequestStore, name: &str, holder: &str) -> Result<()> {
    let result = retry_on_conflict(|| async {
        let mut ur = store.get(name).await?;
        if ur.handler() != holder {
            return Ok(());
        }
        if let Some(status) = ur.status.as_mut() {
            status.handler.clear();
            status.claimed_at = None;
        }
        store.update_status(&ur).await.map(|_| ())
    })
    .await;
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// The claim on `ur` was taken more than `timeout` ago
///
/// Unstamped claims never expire: without a claim time there is no way to
/// tell a slow holder from a dead one.
pub fn expired(ur: &UpdateRequest, timeout: Duration) -> bool {
    let Some(claimed_at) = ur.claimed_at() else {
        return false;
    };
    Utc::now()
        .signed_duration_since(claimed_at)
        .to_std()
        .is_ok_and(|held| held >= timeout)
}
