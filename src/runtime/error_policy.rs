//! # Error Policy
//!
//! Classification and backoff for watch stream errors. Reconciliation errors are
//! handled by the work queues (see `controller::queue::handle_result`).

use crate::constants;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// How a watch error should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    Unauthorized,
    Expired,
    TooManyRequests,
    NotFound,
    Other,
}

impl WatchErrorKind {
    pub fn classify(error_string: &str) -> Self {
        if error_string.contains("401") || error_string.contains("Unauthorized") {
            Self::Unauthorized
        } else if error_string.contains("410")
            || error_string.contains("too old resource version")
            || error_string.contains("Expired")
            || error_string.contains("Gone")
        {
            Self::Expired
        } else if error_string.contains("429")
            || error_string.contains("storage is (re)initializing")
            || error_string.contains("TooManyRequests")
        {
            Self::TooManyRequests
        } else if error_string.contains("ObjectNotFound")
            || (error_string.contains("404") && error_string.contains("not found"))
        {
            Self::NotFound
        } else {
            Self::Other
        }
    }
}

/// Handle one watch stream error, sleeping where the error calls for it
///
/// Returns `None` when the watch should restart, `Some(())` to keep consuming.
pub async fn handle_watch_stream_error(
    watch: &str,
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
) -> Option<()> {
    let restart_delay = Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS);
    match WatchErrorKind::classify(error_string) {
        WatchErrorKind::Unauthorized => {
            error!(watch, "❌ watch authentication failed (401), check the controller's RBAC");
            tokio::time::sleep(restart_delay).await;
            None
        }
        WatchErrorKind::Expired => {
            warn!(watch, error_type = "410", "watch resource version expired, restarting");
            None
        }
        WatchErrorKind::TooManyRequests => {
            let current = backoff.load(Ordering::Relaxed);
            warn!(watch, backoff_ms = current, "API server throttling watch (429), backing off");
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff.store((current * 2).min(max_backoff_ms), Ordering::Relaxed);
            None
        }
        WatchErrorKind::NotFound => {
            warn!(watch, "watched object not found, continuing");
            Some(())
        }
        WatchErrorKind::Other => {
            error!(watch, error = error_string, "watch stream error");
            tokio::time::sleep(restart_delay).await;
            None
        }
    }
}
