//! Per-endpoint-pattern concurrency throttling.
//!
//! Each configured pattern owns a queue with a bound on how many of its jobs
//! may run at once. Jobs wait in priority order (higher first, ties in
//! arrival order); endpoints matching no pattern share a default queue.
//!
//! A job holds a [`Slot`] for as long as it runs. Admission happens in a
//! short, bounded drain loop under the queue lock that runs whenever a job is
//! submitted or a slot is released, so there is never more than one drain in
//! progress per queue and no recursion between runs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::pattern::WildcardPattern;

/// Point-in-time view of one throttle queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleStats {
    pub pattern: String,
    pub max_concurrent: usize,
    pub delay: Duration,
    pub active: usize,
    pub queued: usize,
}

struct Waiter {
    priority: i32,
    seq: u64,
    admit: oneshot::Sender<Slot>,
}

// Max-heap order: higher priority first, then lower sequence number.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

// Limits live next to the counters so a reconfiguration is seen by the
// same lock that admits jobs.
struct QueueState {
    max_concurrent: usize,
    delay: Duration,
    active: usize,
    pending: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct ThrottleQueue {
    pattern: WildcardPattern,
    state: Mutex<QueueState>,
}

impl ThrottleQueue {
    fn new(pattern: &str, max_concurrent: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            pattern: WildcardPattern::new(pattern),
            state: Mutex::new(QueueState {
                max_concurrent: max_concurrent.max(1),
                delay,
                active: 0,
                pending: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    fn delay(&self) -> Duration {
        self.state.lock().delay
    }

    // Running jobs stay counted, so a lowered limit takes effect as they
    // finish and a raised one admits waiters immediately.
    fn reconfigure(self: &Arc<Self>, max_concurrent: usize, delay: Duration) {
        let mut state = self.state.lock();
        state.max_concurrent = max_concurrent.max(1);
        state.delay = delay;
        self.drain(&mut state);
    }

    async fn acquire(self: &Arc<Self>, priority: i32) -> Slot {
        loop {
            let admitted = {
                let mut state = self.state.lock();
                if state.active < state.max_concurrent && state.pending.is_empty() {
                    state.active += 1;
                    return Slot::new(Arc::clone(self));
                }
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.pending.push(Waiter {
                    priority,
                    seq,
                    admit: tx,
                });
                debug!(
                    pattern = %self.pattern,
                    priority,
                    queued = state.pending.len(),
                    "job queued"
                );
                rx
            };

            // The sender only disappears without sending if the waiter was
            // discarded; queue again rather than run unadmitted.
            if let Ok(slot) = admitted.await {
                return slot;
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        self.drain(&mut state);
    }

    // Admits waiters while capacity remains. Waiters whose caller has gone
    // away hand their slot straight back.
    fn drain(self: &Arc<Self>, state: &mut QueueState) {
        while state.active < state.max_concurrent {
            let Some(waiter) = state.pending.pop() else {
                break;
            };
            state.active += 1;
            if let Err(mut unclaimed) = waiter.admit.send(Slot::new(Arc::clone(self))) {
                unclaimed.disarm();
                state.active -= 1;
            }
        }
    }

    fn stats(&self) -> ThrottleStats {
        let state = self.state.lock();
        ThrottleStats {
            pattern: self.pattern.as_str().to_owned(),
            max_concurrent: state.max_concurrent,
            delay: state.delay,
            active: state.active,
            // Waiters whose caller went away are dropped at the next drain;
            // they are not reported as queued meanwhile.
            queued: state
                .pending
                .iter()
                .filter(|waiter| !waiter.admit.is_closed())
                .count(),
        }
    }
}

/// Permission to run one job in a throttle queue. Dropping it frees the slot
/// and admits the next waiter.
pub struct Slot {
    queue: Arc<ThrottleQueue>,
    armed: bool,
}

impl Slot {
    fn new(queue: Arc<ThrottleQueue>) -> Self {
        Self { queue, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Pattern of the queue this slot belongs to.
    pub fn pattern(&self) -> &str {
        self.queue.pattern.as_str()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.queue.release();
        }
    }
}

/// Bounded-concurrency job runner with per-pattern queues.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use apigate::throttle::Throttler;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let throttler = Throttler::new(4, Duration::ZERO);
/// throttler.configure("/api/upload*", 2, Duration::ZERO);
///
/// let size = throttler.throttle("/api/upload/avatar", async { 42 }).await;
/// assert_eq!(size, 42);
/// # }
/// ```
pub struct Throttler {
    rules: RwLock<Vec<Arc<ThrottleQueue>>>,
    default_queue: Arc<ThrottleQueue>,
}

impl Throttler {
    /// Creates a throttler whose default queue (used when no pattern matches)
    /// allows `default_max_concurrent` jobs with `default_delay` pacing.
    pub fn new(default_max_concurrent: usize, default_delay: Duration) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_queue: ThrottleQueue::new("*", default_max_concurrent, default_delay),
        }
    }

    /// Builds a throttler with the default queue and every rule of `config`.
    pub fn from_config(config: &ThrottleConfig) -> Self {
        let throttler = Self::new(config.default_max_concurrent, config.default_delay());
        for rule in &config.rules {
            throttler.configure(&rule.pattern, rule.max_concurrent, rule.delay());
        }
        throttler
    }

    /// Registers limits for endpoints matching `pattern`.
    ///
    /// Patterns are checked in registration order and the first match wins.
    /// Re-configuring an existing pattern keeps its position and its queue:
    /// jobs already running keep counting against the new limit.
    pub fn configure(&self, pattern: &str, max_concurrent: usize, delay: Duration) {
        let mut rules = self.rules.write();
        match rules.iter().find(|q| q.pattern.as_str() == pattern) {
            Some(existing) => existing.reconfigure(max_concurrent, delay),
            None => rules.push(ThrottleQueue::new(pattern, max_concurrent, delay)),
        }
        debug!(pattern, max_concurrent, ?delay, "throttle pattern configured");
    }

    /// Runs `job` under the queue matching `endpoint` at priority `0`.
    pub async fn throttle<F, T>(&self, endpoint: &str, job: F) -> T
    where
        F: Future<Output = T>,
    {
        self.throttle_with_priority(endpoint, job, 0).await
    }

    /// Runs `job` under the queue matching `endpoint`.
    ///
    /// The job waits until its queue has a free slot and no higher-priority
    /// (or equal-priority, earlier) job is waiting, then waits the queue's
    /// delay, then runs. Its outcome, success or failure, belongs to this
    /// caller alone.
    pub async fn throttle_with_priority<F, T>(&self, endpoint: &str, job: F, priority: i32) -> T
    where
        F: Future<Output = T>,
    {
        let queue = self.queue_for(endpoint);
        let slot = queue.acquire(priority).await;
        let delay = queue.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(endpoint, pattern = slot.pattern(), "throttled job started");
        let output = job.await;
        drop(slot);
        output
    }

    /// Acquires a slot without running anything; the slot is held until dropped.
    pub async fn acquire(&self, endpoint: &str, priority: i32) -> Slot {
        self.queue_for(endpoint).acquire(priority).await
    }

    /// Pattern of the queue that `endpoint` would use.
    pub fn resolve(&self, endpoint: &str) -> String {
        self.queue_for(endpoint).pattern.as_str().to_owned()
    }

    /// Stats of the queue registered under exactly `pattern` (`"*"` for the default).
    pub fn stats(&self, pattern: &str) -> Option<ThrottleStats> {
        if let Some(queue) = self
            .rules
            .read()
            .iter()
            .find(|q| q.pattern.as_str() == pattern)
        {
            return Some(queue.stats());
        }
        (pattern == self.default_queue.pattern.as_str()).then(|| self.default_queue.stats())
    }

    /// Stats of every configured queue followed by the default queue.
    pub fn all_stats(&self) -> Vec<ThrottleStats> {
        let mut stats: Vec<ThrottleStats> = self.rules.read().iter().map(|q| q.stats()).collect();
        stats.push(self.default_queue.stats());
        stats
    }

    fn queue_for(&self, endpoint: &str) -> Arc<ThrottleQueue> {
        self.rules
            .read()
            .iter()
            .find(|q| q.pattern.matches(endpoint))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_queue))
    }
}
