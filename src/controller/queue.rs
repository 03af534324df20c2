//! # Work Queue
//!
//! Rate-limited, per-key deduplicating work queue shared by a pool of workers.
//!
//! A key is in at most one of three places:
//! - **queued**: waiting for a worker (adding it again is a no-op)
//! - **processing**: held by a worker; adding it again marks it dirty and it is
//!   re-queued when the worker calls [`WorkQueue::done`]
//! - **absent**
//!
//! Failed keys are re-added through an exponential per-key rate limiter until
//! [`WorkQueue::forget`] resets their history.

use crate::observability::metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RateLimiterConfig {
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
pub struct WorkQueue<K> {
    name: &'static str,
    limiter: RateLimiterConfig,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, limiter: RateLimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            limiter,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a key, collapsing duplicates
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // re-queued by done()
            return;
        }
        state.queue.push_back(key);
        metrics::set_queue_depth(self.name, state.queue.len());
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue after a delay
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue after the key's current backoff and record one more failure
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.limiter.delay_for(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// How many times the key has been rate-limited since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the key's failure history
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Wait for the next key; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(self.name, state.queue.len());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing a key, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            metrics::set_queue_depth(self.name, state.queue.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys; workers drain what is queued and then see `None`
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

/// What happened to a key after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    /// Already gone; history forgotten
    Gone,
    Requeued,
    /// Retry ceiling reached; history forgotten
    Dropped,
}

/// Apply the retry policy to a processing result
///
/// `NotFound` forgets the key, any other error requeues it through the rate
/// limiter until `max_retries` requeues have happened, then the key is dropped.
pub fn handle_result<K>(
    queue: &Arc<WorkQueue<K>>,
    key: &K,
    result: &crate::Result<()>,
    max_retries: u32,
) -> RetryOutcome
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    match result {
        Ok(()) => {
            queue.forget(key);
            RetryOutcome::Succeeded
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(queue = queue.name(), ?key, error = %e, "object gone, forgetting key");
            queue.forget(key);
            RetryOutcome::Gone
        }
        Err(e) if queue.num_requeues(key) < max_retries => {
            tracing::warn!(
                queue = queue.name(),
                ?key,
                attempt = queue.num_requeues(key) + 1,
                error = %e,
                "🔄 processing failed, requeueing"
            );
            metrics::increment_requeues_total(e.as_str());
            queue.add_rate_limited(key.clone());
            RetryOutcome::Requeued
        }
        Err(e) => {
            tracing::error!(
                queue = queue.name(),
                ?key,
                max_retries,
                error = %e,
                "❌ retry ceiling reached, dropping key"
            );
            metrics::increment_dropped_total(queue.name());
            queue.forget(key);
            RetryOutcome::Dropped
        }
    }
}
