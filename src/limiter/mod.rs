//! Sliding-window rate limiting keyed by caller identifier.
//!
//! Every identifier owns the list of its admitted request instants inside the
//! trailing window `[now - window, now]`. A request is admitted while that
//! list holds fewer than `max_requests` instants; admission is recorded under
//! the same lock as the check.
//!
//! Memory per identifier is bounded by `max_requests` instants. Identifiers
//! whose window has fully drained are dropped by [`RateLimiter::cleanup`],
//! which [`RateLimiter::spawn_cleanup`] runs periodically. A very long window
//! keeps idle identifiers alive for that long; choose the window and cleanup
//! interval together.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured maximum per window.
    pub limit: usize,
    /// Admissions left in the current window after this decision.
    pub remaining: usize,
    /// Time until the oldest counted request leaves the window, or a full
    /// window when nothing is counted.
    pub reset_in: Duration,
}

impl RateLimitDecision {
    /// Reset instant as seconds since the Unix epoch, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        let at = SystemTime::now() + self.reset_in;
        let since = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        since.as_secs() + u64::from(since.subsec_nanos() > 0)
    }

    /// Whole seconds a rejected caller should wait, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_in.as_secs() + u64::from(self.reset_in.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Per-identifier sliding-window rate limiter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use apigate::limiter::RateLimiter;
///
/// let limiter = RateLimiter::new(Duration::from_secs(1), 3);
/// let verdicts: Vec<bool> = (0..4).map(|_| limiter.is_allowed("ip1").allowed).collect();
/// assert_eq!(verdicts, [true, true, true, false]);
/// ```
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.max_requests)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Checks `identifier` and, when allowed, counts this request.
    pub fn is_allowed(&self, identifier: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let stamps = windows.entry(identifier.to_owned()).or_default();
        prune(stamps, now, self.window);

        let allowed = stamps.len() < self.max_requests;
        if allowed {
            stamps.push_back(now);
        } else {
            warn!(identifier, limit = self.max_requests, "rate limit exceeded");
        }

        let decision = self.decide(stamps, now, allowed);
        debug!(identifier, allowed, remaining = decision.remaining, "rate limit check");
        decision
    }

    /// Reports what [`is_allowed`](Self::is_allowed) would answer without
    /// counting a request.
    pub fn peek(&self, identifier: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(identifier) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                let allowed = stamps.len() < self.max_requests;
                self.decide(stamps, now, allowed)
            }
            None => self.decide(&VecDeque::new(), now, self.max_requests > 0),
        }
    }

    /// Forgets every request counted for `identifier`.
    pub fn reset(&self, identifier: &str) {
        self.windows.lock().remove(identifier);
    }

    /// Drops identifiers whose window holds no requests any more and returns
    /// how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, "rate limiter dropped idle identifiers");
        }
        removed
    }

    /// Starts the periodic [`cleanup`](Self::cleanup). The task stops by
    /// itself once the limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        crate::background::spawn_periodic("rate-limit-cleanup", self, every, |limiter| {
            limiter.cleanup();
        })
    }

    /// Number of identifiers currently holding a window.
    pub fn tracked_identifiers(&self) -> usize {
        self.windows.lock().len()
    }

    fn decide(&self, stamps: &VecDeque<Instant>, now: Instant, allowed: bool) -> RateLimitDecision {
        let reset_in = match stamps.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => self.window,
        };
        RateLimitDecision {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(stamps.len()),
            reset_in,
        }
    }
}

// An instant leaves the window once `window` has fully elapsed since it.
fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_max_per_window() {
        let limiter = RateLimiter::new(Duration::from_millis(1000), 3);
        let verdicts: Vec<bool> = (0..4).map(|_| limiter.is_allowed("ip1").allowed).collect();
        assert_eq!(verdicts, [true, true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 2);
        assert_eq!(limiter.is_allowed("a").remaining, 1);
        assert_eq!(limiter.is_allowed("a").remaining, 0);
        let rejected = limiter.is_allowed("a");
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.limit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = RateLimiter::new(Duration::from_millis(1000), 2);
        assert!(limiter.is_allowed("a").allowed); // t=0
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.is_allowed("a").allowed); // t=600
        assert!(!limiter.is_allowed("a").allowed);

        // t=1000: the first request leaves, the second is still counted.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.is_allowed("a").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_in_tracks_oldest_request() {
        let limiter = RateLimiter::new(Duration::from_millis(1000), 5);
        limiter.is_allowed("a");
        tokio::time::advance(Duration::from_millis(250)).await;
        let decision = limiter.is_allowed("a");
        assert_eq!(decision.reset_in, Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_resets_after_full_window() {
        let limiter = RateLimiter::new(Duration::from_millis(1000), 5);
        assert_eq!(limiter.peek("nobody").reset_in, Duration::from_millis(1000));
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.is_allowed("ip1").allowed);
        assert!(!limiter.is_allowed("ip1").allowed);
        assert!(limiter.is_allowed("ip2").allowed);
    }

    #[test]
    fn zero_max_blocks_everything() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 0);
        assert!(!limiter.is_allowed("ip1").allowed);
        assert!(!limiter.peek("ip1").allowed);
    }

    #[test]
    fn peek_does_not_count() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.peek("a").allowed);
        assert!(limiter.peek("a").allowed);
        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.peek("a").allowed);
    }

    #[test]
    fn reset_forgets_identifier() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        limiter.is_allowed("a");
        limiter.reset("a");
        assert!(limiter.is_allowed("a").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_only_idle_identifiers() {
        let limiter = RateLimiter::new(Duration::from_millis(500), 10);
        limiter.is_allowed("old");
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.is_allowed("recent");
        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_identifiers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_cleanup_runs() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100), 10));
        limiter.is_allowed("a");
        let _task = limiter.spawn_cleanup(Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(limiter.tracked_identifiers(), 0);
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_in: Duration::from_millis(10),
        };
        assert_eq!(decision.retry_after_secs(), 1);
        let decision = RateLimitDecision {
            reset_in: Duration::from_millis(2100),
            ..decision
        };
        assert_eq!(decision.retry_after_secs(), 3);
    }
}
