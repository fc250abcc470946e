//! De-duplicating, rate-limited work queue
//!
//! Semantics follow the usual controller work queue:
//!
//! - a key is queued at most once; repeated adds collapse into one entry
//! - a key handed to a worker is "processing" and is never handed out twice
//! - adding a processing key marks it dirty; it is queued again once the
//!   owning worker drops its [`WorkItem`]
//! - failed keys come back after an exponential, jittered delay
//!
//! All bookkeeping sits behind one mutex. Waiting workers park on a
//! [`Notify`] and are woken by adds and by [`WorkQueue::shutdown`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracing::trace;

/// Backoff schedule for failed keys.
///
/// The delay for the n-th consecutive failure is
/// `initial_delay * multiplier^(n-1)`, jittered by 0.5x to 1.5x and capped at
/// `max_delay`. Attempts are unbounded.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Create a schedule with the default multiplier
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Un-jittered delay for the given number of consecutive failures
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Jittered delay for the given number of consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.base_delay(failures).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
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

/// Work queue shared between ingestion and workers
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    available: Notify,
    idle: Notify,
    backoff: BackoffConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create an empty queue
    pub fn new(backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            idle: Notify::new(),
            backoff,
        })
    }

    /// Queue a key unless it is already pending.
    ///
    /// Adds after [`shutdown`](Self::shutdown) are ignored.
    pub fn enqueue(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down {
            trace!(?key, "Queue shutting down, dropping key");
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued when the current owner is done
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down, even if keys are pending.
    pub async fn dequeue(self: &Arc<Self>) -> Option<WorkItem<K>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Some(WorkItem {
                        queue: Arc::clone(self),
                        key,
                    });
                }
            }

            notified.await;
        }
    }

    /// Release a processing key, re-queueing it if it was added meanwhile.
    ///
    /// Called by [`WorkItem`]'s drop; calling it for a key that is not
    /// processing is a no-op.
    pub fn mark_done(&self, key: &K) {
        let mut state = self.state.lock();
        if !state.processing.remove(key) {
            return;
        }
        let requeue = state.dirty.contains(key) && !state.shutting_down;
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.available.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Queue a key again after its backoff delay; returns the delay used
    pub fn requeue_with_backoff(self: &Arc<Self>, key: K) -> Duration {
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = self.backoff.delay(failures);

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
        delay
    }

    /// Reset a key's failure count after a success
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently owned by workers
    pub fn in_flight(&self) -> usize {
        self.state.lock().processing.len()
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
    }

    /// Wait until no key is being processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Ownership of a dequeued key; marks the key done when dropped
pub struct WorkItem<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    queue: Arc<WorkQueue<K>>,
    key: K,
}

impl<K> WorkItem<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// The key being processed
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for WorkItem<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    fn drop(&mut self) {
        self.queue.mark_done(&self.key);
    }
}
