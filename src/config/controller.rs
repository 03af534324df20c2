//! # Background Controller Configuration
//!
//! Worker pool, retry and orphan-cleanup settings.

use super::env_var_or_default;
use crate::constants::*;
use crate::controller::backoff::BoundedBackoff;
use crate::controller::queue::RateLimiterConfig;
use std::time::Duration;

/// Background controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding UpdateRequests
    pub namespace: String,
    /// Claim token written into `status.handler`; the pod name in a cluster
    pub instance: String,
    pub background_workers: usize,
    pub cleanup_workers: usize,
    /// Requeues allowed before a key is dropped
    pub max_retries: u32,
    /// Retry-count value at which an orphaned UR is deleted
    pub orphan_retry_threshold: u32,
    pub orphan_resync_interval: Duration,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub generator_backoff: BoundedBackoff,
    /// Release expired claims whose handler pod no longer exists
    pub reclaim_stale_handlers: bool,
    /// Age after which a claim counts as expired
    pub claim_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_KYVERNO_NAMESPACE.to_string(),
            instance: default_instance(),
            background_workers: DEFAULT_BACKGROUND_WORKERS,
            cleanup_workers: DEFAULT_CLEANUP_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            orphan_retry_threshold: DEFAULT_ORPHAN_RETRY_THRESHOLD,
            orphan_resync_interval: Duration::from_secs(DEFAULT_ORPHAN_RESYNC_INTERVAL_SECS),
            queue_base_delay: Duration::from_millis(DEFAULT_QUEUE_BASE_DELAY_MS),
            queue_max_delay: Duration::from_secs(DEFAULT_QUEUE_MAX_DELAY_SECS),
            generator_backoff: BoundedBackoff::default(),
            reclaim_stale_handlers: instance_is_pod(),
            claim_timeout: Duration::from_secs(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }
}

/// Handler names are only checkable against pods when the downward API supplies one
fn instance_is_pod() -> bool {
    std::env::var("KYVERNO_POD_NAME").is_ok_and(|name| !name.is_empty())
}

fn default_instance() -> String {
    std::env::var("KYVERNO_POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("background-controller-{}", uuid::Uuid::new_v4()))
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            namespace: env_var_or_default(
                "KYVERNO_NAMESPACE",
                DEFAULT_KYVERNO_NAMESPACE.to_string(),
            ),
            instance: default_instance(),
            background_workers: env_var_or_default("BACKGROUND_WORKERS", DEFAULT_BACKGROUND_WORKERS)
                .max(1),
            cleanup_workers: env_var_or_default("CLEANUP_WORKERS", DEFAULT_CLEANUP_WORKERS).max(1),
            max_retries: env_var_or_default("UR_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            orphan_retry_threshold: env_var_or_default(
                "ORPHAN_RETRY_THRESHOLD",
                DEFAULT_ORPHAN_RETRY_THRESHOLD,
            ),
            orphan_resync_interval: Duration::from_secs(env_var_or_default(
                "ORPHAN_RESYNC_INTERVAL_SECS",
                DEFAULT_ORPHAN_RESYNC_INTERVAL_SECS,
            )),
            queue_base_delay: Duration::from_millis(env_var_or_default(
                "QUEUE_BASE_DELAY_MS",
                DEFAULT_QUEUE_BASE_DELAY_MS,
            )),
            queue_max_delay: Duration::from_secs(env_var_or_default(
                "QUEUE_MAX_DELAY_SECS",
                DEFAULT_QUEUE_MAX_DELAY_SECS,
            )),
            generator_backoff: BoundedBackoff {
                initial: Duration::from_millis(env_var_or_default(
                    "GENERATOR_INITIAL_BACKOFF_MS",
                    DEFAULT_GENERATOR_INITIAL_BACKOFF_MS,
                )),
                multiplier: env_var_or_default(
                    "GENERATOR_BACKOFF_MULTIPLIER",
                    DEFAULT_GENERATOR_BACKOFF_MULTIPLIER,
                ),
                max_delay: Duration::from_millis(env_var_or_default(
                    "GENERATOR_MAX_BACKOFF_MS",
                    DEFAULT_GENERATOR_MAX_BACKOFF_MS,
                )),
                budget: Duration::from_millis(env_var_or_default(
                    "GENERATOR_BUDGET_MS",
                    DEFAULT_GENERATOR_BUDGET_MS,
                )),
            },
            reclaim_stale_handlers: env_var_or_default(
                "RECLAIM_STALE_HANDLERS",
                instance_is_pod(),
            ),
            claim_timeout: Duration::from_secs(env_var_or_default(
                "CLAIM_TIMEOUT_SECS",
                DEFAULT_CLAIM_TIMEOUT_SECS,
            )),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            base_delay: self.queue_base_delay,
            max_delay: self.queue_max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.namespace, "kyverno");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.orphan_retry_threshold, 5);
        assert!(!config.instance.is_empty());
        assert_eq!(config.rate_limiter().base_delay, Duration::from_millis(5));
        assert_eq!(config.claim_timeout, Duration::from_secs(600));
        assert_eq!(config.reclaim_stale_handlers, instance_is_pod());
    }

    #[test]
    fn test_unparsable_value_falls_back_to_default() {
        assert_eq!(env_var_or_default("UR_TEST_UNSET_VARIABLE_XYZ", 7u32), 7);
    }
}
