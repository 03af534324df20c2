//! # Status Reconciliation
//!
//! Runs after a successful execution. Completed URs are ephemeral queue
//! entries and are deleted; anything else is left for the next cycle.

use crate::client::UpdateRequestStore;
use crate::crd::UrState;
use crate::observability::metrics;
use crate::Result;
use tracing::{debug, info};

/// Re-read the UR and retire it when Completed
///
/// Returns the observed state, or `None` when the UR is gone. A failed read
/// that is not `NotFound` is returned as an error: a cached or assumed state
/// here could leave an already Completed UR behind.
pub async fn reconcile_status(
    store: &dyn UpdateRequestStore,
    name: &str,
) -> Result<Option<UrState>> {
    let ur = match store.get(name).await {
        Ok(ur) => ur,
        Err(e) if e.is_not_found() => {
            debug!(ur.name = name, "update request already gone");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let state = ur.state();
    if state == Some(UrState::Completed) {
        match store.delete(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(ur.name = name, "✅ update request completed and removed");
        metrics::increment_update_requests_deleted("completed");
    }
    Ok(state)
}
