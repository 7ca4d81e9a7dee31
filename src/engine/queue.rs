//! Deduplicating, rate-limited work queue.
//!
//! Keys flow through three states: queued, dirty, processing. While a key is
//! in flight (between [`WorkQueue::get`] and [`WorkQueue::done`]), further
//! adds for the same key are recorded in the dirty set but not delivered; the
//! key is redelivered exactly once after `done`. This is what gives every
//! controller single-flight processing per key no matter how bursty the watch
//! stream is.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

use crate::engine::cache::ObjectKey;

/// Base delay for the per-key exponential backoff rate limiter
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Cap for the per-key exponential backoff rate limiter
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shut_down: bool,
}

/// Rate-limited work queue of pending resource keys.
///
/// Shared between the change notifier (producer side) and the dispatcher
/// workers (consumer side). All methods are safe to call concurrently.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl WorkQueue {
    /// Create a queue with the given backoff bounds
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue a key for processing.
    ///
    /// A key that is already pending is not enqueued again; a key that is
    /// currently in flight is marked dirty and redelivered after `done`.
    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shut_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Suspends the caller until a key is available. Returns `None` once the
    /// queue has been shut down and drained.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a concurrent
            // add cannot slip between the check and the await.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as finished processing.
    ///
    /// If the key was re-added while in flight it is requeued now, exactly
    /// once, regardless of how many adds coalesced.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.queue.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Requeue a key after its per-key exponential backoff delay.
    ///
    /// Each call bumps the key's failure count; the delay doubles per failure
    /// up to the configured cap, with jitter to avoid thundering herds.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let failures = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shut_down {
                return;
            }
            let entry = state.failures.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = self.backoff_delay(failures);
        debug!(key = %key, failures, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Requeue a key after a fixed delay
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the backoff for a key after a successful reconcile
    pub fn forget(&self, key: &ObjectKey) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.failures.remove(key);
    }

    /// Observed failure count for a key since it was last forgotten
    pub fn retries(&self, key: &ObjectKey) -> u32 {
        let state = self.state.lock().expect("queue lock poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be delivered
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue.
    ///
    /// Pending keys are still delivered and in-flight keys may finish;
    /// afterwards `get` returns `None` and new adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.shut_down = true;
        }
        self.notify.notify_waiters();
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        // 0.5x-1.5x jitter so colliding keys spread out
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}
