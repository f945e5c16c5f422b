//! In-flight request deduplication behind a global concurrency cap.
//!
//! Identical concurrent requests (same key) collapse into one *ticket*: the
//! first caller starts the work, later callers await the same shared result.
//! Distinct keys compete for `concurrent_limit` execution slots, handed out in
//! arrival order; callers that join an existing ticket never take a slot.
//!
//! The work runs on its own task, so it completes and frees its slot even if
//! every caller stops waiting. A ticket is removed as soon as its work settles,
//! successfully or not, so results are never cached here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::client::GatewayError;

type Ticket<T> = Shared<BoxFuture<'static, Result<T, GatewayError>>>;

/// Collapses concurrent identical work and bounds distinct work globally.
pub struct Deduplicator<T> {
    tickets: Arc<Mutex<HashMap<String, Ticket<T>>>>,
    slots: Arc<Semaphore>,
    limit: usize,
    queued: Arc<AtomicUsize>,
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a deduplicator allowing `concurrent_limit` distinct keys to
    /// execute at once (at least one).
    pub fn new(concurrent_limit: usize) -> Self {
        let limit = concurrent_limit.max(1);
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs `work` for `key`, or joins the execution already in flight for it.
    ///
    /// Every caller of one ticket receives a clone of the same outcome,
    /// including the same error.
    ///
    /// # Examples
    ///
    /// ```
    /// use apigate::dedup::Deduplicator;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let dedup: Deduplicator<u32> = Deduplicator::new(4);
    /// let (a, b) = tokio::join!(
    ///     dedup.enqueue("GET:/news/42", async { Ok(42) }),
    ///     dedup.enqueue("GET:/news/42", async { Ok(0) }),
    /// );
    /// assert_eq!((a, b), (Ok(42), Ok(42)));
    /// # }
    /// ```
    pub async fn enqueue<F>(&self, key: &str, work: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let ticket = {
            let mut tickets = self.tickets.lock();
            match tickets.get(key) {
                Some(ticket) => {
                    debug!(key, "joined in-flight request");
                    ticket.clone()
                }
                None => {
                    let ticket = self.start(key.to_owned(), work);
                    tickets.insert(key.to_owned(), ticket.clone());
                    ticket
                }
            }
        };
        ticket.await
    }

    fn start<F>(&self, key: String, work: F) -> Ticket<T>
    where
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let tickets = Arc::clone(&self.tickets);
        let slots = Arc::clone(&self.slots);
        let queued = Arc::clone(&self.queued);

        let task = tokio::spawn(async move {
            queued.fetch_add(1, Ordering::SeqCst);
            let permit = slots.acquire_owned().await;
            queued.fetch_sub(1, Ordering::SeqCst);

            let settled = SettleGuard { tickets, key };
            match permit {
                Ok(_permit) => {
                    debug!(key = %settled.key, "executing request");
                    work.await
                }
                Err(_) => Err(GatewayError::Aborted("execution slots closed".to_owned())),
            }
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(GatewayError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Number of distinct keys currently in flight, executing or queued.
    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Number of keys currently holding an execution slot.
    pub fn executing(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Number of keys waiting for an execution slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn concurrent_limit(&self) -> usize {
        self.limit
    }
}

// Removes the ticket once its work settles, including by panic.
struct SettleGuard<T> {
    tickets: Arc<Mutex<HashMap<String, Ticket<T>>>>,
    key: String,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        self.tickets.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::join_all;

    #[tokio::test(start_paused = true)]
    async fn identical_calls_execute_once() {
        let dedup: Deduplicator<String> = Deduplicator::new(4);
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..5).map(|_| {
            let calls = Arc::clone(&calls);
            dedup.enqueue("GET:/news/42", async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("story".to_owned())
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Ok("story")));
    }

    #[tokio::test(start_paused = true)]
    async fn joined_callers_share_the_failure() {
        let dedup: Deduplicator<u8> = Deduplicator::new(4);
        let results = join_all((0..3).map(|_| {
            dedup.enqueue("GET:/broken", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(GatewayError::Timeout(Duration::from_millis(10)))
            })
        }))
        .await;

        for result in results {
            assert_eq!(result, Err(GatewayError::Timeout(Duration::from_millis(10))));
        }
    }

    #[tokio::test]
    async fn settled_ticket_is_removed() {
        let dedup: Deduplicator<u8> = Deduplicator::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = dedup
                .enqueue("k", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
            assert_eq!(result, Ok(1));
            assert_eq!(dedup.in_flight(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_respect_the_cap() {
        let dedup: Deduplicator<usize> = Deduplicator::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let start = tokio::time::Instant::now();
        let keys: Vec<String> = (0..4).map(|i| format!("GET:/item/{i}")).collect();

        let results = join_all(keys.iter().enumerate().map(|(i, key)| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            dedup.enqueue(key, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })
        }))
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(
            results.into_iter().collect::<Result<Vec<_>, _>>(),
            Ok(vec![0, 1, 2, 3])
        );
        assert_eq!((dedup.executing(), dedup.queued()), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_keys_start_in_arrival_order() {
        let dedup: Deduplicator<()> = Deduplicator::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let keys = ["k0", "k1", "k2"];

        join_all(keys.iter().enumerate().map(|(i, key)| {
            let order = Arc::clone(&order);
            dedup.enqueue(key, async move {
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
        }))
        .await;

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn panicking_work_surfaces_as_aborted() {
        let dedup: Deduplicator<u8> = Deduplicator::new(1);
        let result = dedup
            .enqueue("k", async {
                let exploded = true;
                if exploded {
                    panic!("backend exploded");
                }
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Aborted(_))));
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(dedup.enqueue("k", async { Ok(2) }).await, Ok(2));
    }
}
