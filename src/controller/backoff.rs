//! # Retry Backoff
//!
//! Time-bounded exponential retry for producer writes, and a short fixed retry
//! loop for optimistic-concurrency conflicts.

use crate::constants;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with a per-delay cap and a total time budget
#[derive(Debug, Clone, Copy)]
pub struct BoundedBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub budget: Duration,
}

impl Default for BoundedBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(constants::DEFAULT_GENERATOR_INITIAL_BACKOFF_MS),
            multiplier: constants::DEFAULT_GENERATOR_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(constants::DEFAULT_GENERATOR_MAX_BACKOFF_MS),
            budget: Duration::from_millis(constants::DEFAULT_GENERATOR_BUDGET_MS),
        }
    }
}

impl BoundedBackoff {
    /// Delays between attempts; their sum never exceeds the budget
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut next = self.initial;
        let mut spent = Duration::ZERO;
        while !next.is_zero() && spent + next <= self.budget {
            delays.push(next);
            spent += next;
            next = next.mul_f64(self.multiplier).min(self.max_delay);
        }
        delays
    }

    /// Run `op` until it succeeds or the budget is spent, returning the last error
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.delays().into_iter();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        debug!(operation, error = %e, delay_ms = delay.as_millis(), "retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// Retry `op` while it fails with `Conflict`; other errors return immediately
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let delay = Duration::from_millis(constants::DEFAULT_CONFLICT_RETRY_DELAY_MS);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(Error::Conflict { .. }) if attempt < constants::DEFAULT_CONFLICT_RETRY_STEPS => {
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
