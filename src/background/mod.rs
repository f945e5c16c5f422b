//! Background maintenance: periodic sweeps owned by shared components.
//!
//! The cache sweep and the rate-limiter cleanup both need a timer that fires
//! on a fixed interval for as long as the owning component is alive. The
//! task holds only a [`Weak`] reference, so dropping the last [`Arc`] of the
//! owner ends the task on its next tick; aborting the returned handle ends it
//! immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs `job` against `owner` every `period` until the owner is dropped.
///
/// The first run happens one full `period` after spawning. Missed ticks (a
/// stalled runtime) are not replayed back-to-back.
///
/// Must be called from within a Tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use apigate::background::spawn_periodic;
///
/// struct Counter(std::sync::atomic::AtomicUsize);
///
/// # async fn example() {
/// let counter = Arc::new(Counter(Default::default()));
/// let handle = spawn_periodic("counter", &counter, Duration::from_secs(1), |c| {
///     c.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
/// });
/// drop(counter); // the task exits on its next tick
/// # let _ = handle;
/// # }
/// ```
pub fn spawn_periodic<T, F>(
    name: &'static str,
    owner: &Arc<T>,
    period: Duration,
    job: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    let weak: Weak<T> = Arc::downgrade(owner);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(owner) = weak.upgrade() else {
                tracing::debug!(task = name, "owner dropped, stopping periodic task");
                break;
            };
            job(&owner);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_on_every_period() {
        let hits = Arc::new(AtomicUsize::new(0));
        let _handle = spawn_periodic("test", &hits, Duration::from_millis(100), |h| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_owner_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic("test", &hits, Duration::from_millis(100), |h| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(hits);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.is_finished());
    }
}
