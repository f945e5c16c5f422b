//! Response cache: TTL expiry, LRU eviction, pattern invalidation.
//!
//! [`CacheStore`] maps string keys to [`CacheEntry`] values. Every entry
//! carries its own time-to-live; expired entries are dropped lazily on
//! access and proactively by a periodic sweep. Recency is kept by an
//! [`lru::LruCache`]: reads and writes promote a key, and when the store is
//! full the least recently used entry is popped before a new key goes in.
//!
//! The store is synchronous: every operation takes a short-lived lock and
//! never suspends, so callers get read-your-writes immediately after
//! [`set`](CacheStore::set).
//!
//! An optional [`CachePersistence`] strategy can restore a snapshot at
//! construction and save one on demand or after every sweep. Without one the
//! store is purely in-memory.

pub mod persistence;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::pattern::WildcardPattern;

pub use persistence::{CachePersistence, CacheSnapshot, JsonFilePersistence, SnapshotEntry};

/// Errors raised by snapshot persistence. Lookups and inserts never fail.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validators a backend attaches to a response so that a later request can
/// be answered with "not modified" instead of a full payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freshness {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Freshness {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }
}

/// A cached value plus the metadata needed to expire and revalidate it.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl<V> CacheEntry<V> {
    /// Absolute instant at which the entry stops being served.
    pub fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Time elapsed since the entry was stored.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }
}

/// Point-in-time counters of a [`CacheStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// Each slot keeps the instant of its last read or write next to the entry.
// Recency order itself is the list order of the `LruCache`.
type Slot<V> = (CacheEntry<V>, Instant);

struct Inner<V> {
    entries: LruCache<String, Slot<V>>,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn evict_lru(&mut self) -> Option<String> {
        let (victim, _) = self.entries.pop_lru()?;
        self.stats.evictions += 1;
        Some(victim)
    }

    fn remove_where(&mut self, doomed: impl Fn(&CacheEntry<V>) -> bool) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (entry, _))| doomed(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.entries.pop(key);
        }
        keys.len()
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        self.remove_where(|entry| entry.is_expired_at(now))
    }

    fn remove_matching(&mut self, matches: impl Fn(&str) -> bool) -> usize {
        self.remove_where(|entry| matches(&entry.key))
    }
}

/// Key → entry store with TTL expiry and least-recently-used eviction.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use apigate::cache::{CacheStore, Freshness};
///
/// let cache: CacheStore<String> = CacheStore::new(Duration::from_secs(60), 100);
/// cache.set("GET:/news/42", "story".to_owned(), None, Freshness::default());
/// assert_eq!(cache.get("GET:/news/42").as_deref(), Some("story"));
///
/// assert_eq!(cache.invalidate("GET:/news*"), 1);
/// assert!(cache.get("GET:/news/42").is_none());
/// ```
pub struct CacheStore<V> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
    max_size: usize,
    persistence: Option<Arc<dyn CachePersistence<V>>>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty in-memory store. A `max_size` of zero is treated as one.
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            default_ttl,
            max_size: capacity.get(),
            persistence: None,
        }
    }

    /// Creates an empty store from the cache section of the gateway config.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_size)
    }

    /// Attaches a persistence strategy and restores its latest snapshot.
    ///
    /// A missing or unreadable snapshot is logged and ignored: the store
    /// starts empty rather than failing.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn CachePersistence<V>>) -> Self {
        match persistence.load() {
            Ok(Some(snapshot)) => {
                let restored = self.restore(snapshot);
                debug!(restored, "cache snapshot restored");
            }
            Ok(None) => debug!("no cache snapshot to restore"),
            Err(e) => warn!(error = %e, "ignoring unreadable cache snapshot"),
        }
        self.persistence = Some(persistence);
        self
    }

    /// Default time-to-live applied when [`set`](Self::set) is called without one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns a clone of the value stored under `key`, or `None` when absent
    /// or expired. Expired entries are removed on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(expired) = inner.entries.peek(key).map(|(entry, _)| entry.is_expired_at(now))
        else {
            inner.stats.misses += 1;
            debug!(key, "cache miss");
            return None;
        };

        if expired {
            inner.entries.pop(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!(key, "cache entry expired");
            return None;
        }

        let (entry, accessed) = inner.entries.get_mut(key)?;
        *accessed = now;
        let value = entry.value.clone();
        inner.stats.hits += 1;
        debug!(key, "cache hit");
        Some(value)
    }

    /// Returns the full live entry for `key` without counting a hit or
    /// refreshing its access stamp.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .map(|(entry, _)| entry)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    /// Stores `value` under `key`, replacing any previous entry and resetting
    /// its age. When inserting a new key into a full store, the least recently
    /// accessed entry is evicted first.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, freshness: Freshness) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.entries.contains(key) && inner.entries.len() >= self.max_size {
            if let Some(victim) = inner.evict_lru() {
                debug!(victim = %victim, "cache full, evicted least recently used entry");
            }
        }

        let entry = CacheEntry {
            key: key.to_owned(),
            value,
            stored_at: now,
            ttl: ttl.unwrap_or(self.default_ttl),
            etag: freshness.etag,
            last_modified: freshness.last_modified,
        };
        inner.entries.put(key.to_owned(), (entry, now));
    }

    /// Resets the age of a live entry, as after a successful revalidation.
    /// Returns `false` if the key is absent or already expired.
    pub fn refresh(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some((entry, accessed)) if !entry.is_expired_at(now) => {
                entry.stored_at = now;
                *accessed = now;
                true
            }
            _ => false,
        }
    }

    /// When `key` was last read or written, if it is held.
    pub fn last_accessed(&self, key: &str) -> Option<Instant> {
        self.inner.lock().entries.peek(key).map(|(_, accessed)| *accessed)
    }

    /// Removes a single key. Returns `true` if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Removes every key matching the wildcard `pattern` (`*` = any sequence)
    /// and returns how many were dropped.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let pattern = WildcardPattern::new(pattern);
        let removed = self.inner.lock().remove_matching(|key| pattern.matches(key));
        debug!(pattern = %pattern, removed, "cache invalidated");
        removed
    }

    /// Removes every key matched by `regex` and returns how many were dropped.
    pub fn invalidate_regex(&self, regex: &Regex) -> usize {
        let removed = self.inner.lock().remove_matching(|key| regex.is_match(key));
        debug!(pattern = %regex, removed, "cache invalidated");
        removed
    }

    /// Returns `true` if the cached copy of `key` cannot be trusted against
    /// the supplied validators: no live entry exists, or a supplied token
    /// differs from the stored one. Tokens passed as `None` are not compared.
    pub fn is_stale(&self, key: &str, etag: Option<&str>, last_modified: Option<&str>) -> bool {
        let Some(entry) = self.get_entry(key) else {
            return true;
        };
        let etag_differs = etag.is_some_and(|tag| entry.etag.as_deref() != Some(tag));
        let modified_differs =
            last_modified.is_some_and(|lm| entry.last_modified.as_deref() != Some(lm));
        etag_differs || modified_differs
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let removed = inner.remove_expired(now);
        inner.stats.expirations += removed as u64;
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    /// Starts the periodic expiry sweep. When a persistence strategy is
    /// attached, a snapshot is saved after each sweep on a best-effort basis.
    ///
    /// The task stops by itself once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        crate::background::spawn_periodic("cache-sweep", self, every, |store| {
            store.sweep();
            if store.persistence.is_some() {
                if let Err(e) = store.persist() {
                    warn!(error = %e, "cache snapshot save failed");
                }
            }
        })
    }

    /// Saves a snapshot of all live entries through the attached strategy.
    /// Returns the number of entries written, or `0` without a strategy.
    ///
    /// # Errors
    ///
    /// Whatever the persistence strategy reports.
    pub fn persist(&self) -> Result<usize, CacheError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let snapshot = self.snapshot();
        let written = snapshot.entries.len();
        persistence.save(&snapshot)?;
        Ok(written)
    }

    /// Captures all live entries, least recently used first.
    pub fn snapshot(&self) -> CacheSnapshot<V> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let entries = inner
            .entries
            .iter()
            .rev()
            .map(|(_, (entry, _))| entry)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| SnapshotEntry {
                key: entry.key.clone(),
                value: entry.value.clone(),
                age_ms: millis(now.saturating_duration_since(entry.stored_at)),
                ttl_ms: millis(entry.ttl),
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
            })
            .collect();
        CacheSnapshot {
            saved_at: Utc::now(),
            entries,
        }
    }

    // Entries keep the age they had when saved plus the wall-clock time that
    // passed since; anything past its TTL is skipped.
    fn restore(&self, snapshot: CacheSnapshot<V>) -> usize {
        let now = Instant::now();
        let downtime = (Utc::now() - snapshot.saved_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let mut inner = self.inner.lock();
        let mut restored = 0;

        for saved in snapshot.entries {
            if inner.entries.len() >= self.max_size {
                break;
            }
            let ttl = Duration::from_millis(saved.ttl_ms);
            let age = Duration::from_millis(saved.age_ms) + downtime;
            if age >= ttl {
                continue;
            }
            let Some(stored_at) = now.checked_sub(age) else {
                continue;
            };
            let entry = CacheEntry {
                key: saved.key.clone(),
                value: saved.value,
                stored_at,
                ttl,
                etag: saved.etag,
                last_modified: saved.last_modified,
            };
            inner.entries.put(saved.key, (entry, now));
            restored += 1;
        }
        restored
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys currently held, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            ..inner.stats
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_size: usize) -> CacheStore<String> {
        CacheStore::new(Duration::from_millis(1000), max_size)
    }

    fn put(cache: &CacheStore<String>, key: &str) {
        cache.set(key, key.to_uppercase(), None, Freshness::default());
    }

    #[tokio::test(start_paused = true)]
    async fn value_served_until_ttl_elapses() {
        let cache = store(10);
        cache.set("k", "v".to_owned(), None, Freshness::default());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty(), "expired entry removed on access");
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_boundary_is_exclusive() {
        let cache = store(10);
        cache.set("k", "v".to_owned(), Some(Duration::from_millis(200)), Freshness::default());

        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_resets_age() {
        let cache = store(10);
        put(&cache, "k");
        tokio::time::advance(Duration::from_millis(800)).await;
        cache.set("k", "fresh".to_owned(), None, Freshness::default());
        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(cache.get("k").as_deref(), Some("fresh"));
    }

    #[test]
    fn size_never_exceeds_max() {
        let cache = store(3);
        for i in 0..20 {
            put(&cache, &format!("key-{i}"));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 17);
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = store(3);
        put(&cache, "a");
        put(&cache, "b");
        put(&cache, "c");

        // Reading "a" makes "b" the oldest access.
        assert!(cache.get("a").is_some());
        put(&cache, "d");

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_accessed_follows_reads_and_removals() {
        let cache = store(10);
        put(&cache, "k");
        let written = cache.last_accessed("k").unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;
        cache.get("k");
        assert_eq!(
            cache.last_accessed("k").unwrap() - written,
            Duration::from_millis(300)
        );

        cache.remove("k");
        assert!(cache.last_accessed("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_and_overwrite_promote_keys() {
        let cache = store(3);
        put(&cache, "a");
        put(&cache, "b");
        put(&cache, "c");
        assert_eq!(cache.keys(), vec!["c", "b", "a"]);

        assert!(cache.refresh("a"));
        put(&cache, "b");
        assert_eq!(cache.keys(), vec!["b", "a", "c"]);

        put(&cache, "d");
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "d"]);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let cache = store(0);
        put(&cache, "a");
        put(&cache, "b");
        assert_eq!(cache.keys(), vec!["b"]);
        assert_eq!(cache.stats().max_size, 1);
    }

    #[test]
    fn overwriting_full_store_does_not_evict() {
        let cache = store(2);
        put(&cache, "a");
        put(&cache, "b");
        put(&cache, "a");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn invalidate_removes_only_matching_keys() {
        let cache = store(10);
        for key in ["GET:/news/1", "GET:/news/2", "GET:/events/1", "POST:/news"] {
            put(&cache, key);
        }

        assert_eq!(cache.invalidate("GET:/news*"), 2);

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["GET:/events/1", "POST:/news"]);
    }

    #[test]
    fn invalidate_regex_removes_matches() {
        let cache = store(10);
        put(&cache, "GET:/users/1");
        put(&cache, "GET:/users/22");
        put(&cache, "GET:/users/me");
        let removed = cache.invalidate_regex(&Regex::new(r"^GET:/users/\d+$").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(cache.keys(), vec!["GET:/users/me"]);
    }

    #[test]
    fn is_stale_compares_freshness_tokens() {
        let cache = store(10);
        cache.set(
            "k",
            "v".to_owned(),
            None,
            Freshness::new(Some("\"abc\"".to_owned()), Some("Tue, 01 Sep 2026 10:00:00 GMT".to_owned())),
        );

        assert!(cache.is_stale("missing", None, None));
        assert!(!cache.is_stale("k", None, None));
        assert!(!cache.is_stale("k", Some("\"abc\""), None));
        assert!(cache.is_stale("k", Some("\"xyz\""), None));
        assert!(cache.is_stale("k", None, Some("Wed, 02 Sep 2026 10:00:00 GMT")));
        assert!(!cache.is_stale("k", Some("\"abc\""), Some("Tue, 01 Sep 2026 10:00:00 GMT")));
    }

    #[test]
    fn is_stale_when_token_supplied_but_none_stored() {
        let cache = store(10);
        put(&cache, "k");
        assert!(cache.is_stale("k", Some("\"abc\""), None));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries_only() {
        let cache = store(10);
        cache.set("short", "s".to_owned(), Some(Duration::from_millis(100)), Freshness::default());
        cache.set("long", "l".to_owned(), Some(Duration::from_secs(10)), Freshness::default());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.keys(), vec!["long"]);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let cache = Arc::new(store(10));
        cache.set("k", "v".to_owned(), Some(Duration::from_millis(50)), Freshness::default());
        let _sweeper = cache.spawn_sweeper(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = store(10);
        put(&cache, "k");
        cache.get("k");
        cache.get("k");
        cache.get("nope");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_live_entries_only() {
        let cache = store(10);
        put(&cache, "k");
        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(cache.refresh("k"));
        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(!cache.refresh("k"));
    }

    #[test]
    fn get_entry_does_not_count_as_access() {
        let cache = store(2);
        put(&cache, "a");
        put(&cache, "b");
        assert!(cache.get_entry("a").is_some());
        put(&cache, "c");
        assert!(cache.get_entry("a").is_none(), "peek must not protect from eviction");
        assert_eq!(cache.stats().hits, 0);
    }
}
