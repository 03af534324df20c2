//! # Generate Metrics
//!
//! Metrics for UR production and downstream resource lifecycle.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::IntCounterVec;
use std::sync::LazyLock;

static GENERATOR_APPLY_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kyverno_background_generator_apply_total",
            "UpdateRequest producer outcomes (created, updated, skipped, failed)",
        ),
        &["outcome"],
    )
    .expect("Failed to create GENERATOR_APPLY_TOTAL metric - this should never happen")
});

static DOWNSTREAM_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kyverno_background_downstream_writes_total",
            "Downstream resources written by background rules",
        ),
        &["operation"],
    )
    .expect("Failed to create DOWNSTREAM_WRITES_TOTAL metric - this should never happen")
});

static DOWNSTREAM_DELETIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kyverno_background_downstream_deletions_total",
            "Downstream resources deleted by the background pipeline",
        ),
        &["reason"],
    )
    .expect("Failed to create DOWNSTREAM_DELETIONS_TOTAL metric - this should never happen")
});

static UPDATE_REQUESTS_DELETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kyverno_background_update_requests_deleted_total",
            "UpdateRequests deleted, by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create UPDATE_REQUESTS_DELETED_TOTAL metric - this should never happen")
});

/// Register generate metrics with the registry
pub(crate) fn register_generate_metrics() -> Result<()> {
    REGISTRY.register(Box::new(GENERATOR_APPLY_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_DELETIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPDATE_REQUESTS_DELETED_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_generator_apply(outcome: &str) {
    GENERATOR_APPLY_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_downstream_writes(operation: &str) {
    DOWNSTREAM_WRITES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_downstream_deletions(reason: &str) {
    DOWNSTREAM_DELETIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_update_requests_deleted(reason: &str) {
    UPDATE_REQUESTS_DELETED_TOTAL.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_generator_apply() {
        let before = GENERATOR_APPLY_TOTAL.with_label_values(&["created"]).get();
        increment_generator_apply("created");
        assert_eq!(GENERATOR_APPLY_TOTAL.with_label_values(&["created"]).get(), before + 1);
    }

    #[test]
    fn test_increment_downstream_counters() {
        let writes = DOWNSTREAM_WRITES_TOTAL.with_label_values(&["create"]).get();
        let deletions = DOWNSTREAM_DELETIONS_TOTAL.with_label_values(&["policy-deleted"]).get();
        increment_downstream_writes("create");
        increment_downstream_deletions("policy-deleted");
        assert_eq!(DOWNSTREAM_WRITES_TOTAL.with_label_values(&["create"]).get(), writes + 1);
        assert_eq!(
            DOWNSTREAM_DELETIONS_TOTAL.with_label_values(&["policy-deleted"]).get(),
            deletions + 1
        );
    }

    #[test]
    fn test_increment_update_requests_deleted() {
        let before = UPDATE_REQUESTS_DELETED_TOTAL.with_label_values(&["completed"]).get();
        increment_update_requests_deleted("completed");
        assert_eq!(
            UPDATE_REQUESTS_DELETED_TOTAL.with_label_values(&["completed"]).get(),
            before + 1
        );
    }
}
