//! Result cache with TTL expiry and LRU eviction.
//!
//! Expiry is lazy: an entry past its deadline is unreadable immediately and is
//! physically removed on the next read or sweep. Capacity eviction picks the
//! entry with the oldest access sequence number, which keeps ordering exact
//! even when several accesses share a timestamp.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use glob::{Pattern, PatternError};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cancellation::CancellationToken;

/// Key/value store used by the pipeline to deduplicate work
pub trait CacheProvider: Send + Sync {
    /// Value for `key`, unless absent or expired. Touches the entry.
    fn read(&self, key: &str) -> Option<Value>;

    /// Insert or overwrite. `ttl = None` uses the provider's default.
    fn write(&self, key: &str, value: Value, ttl: Option<Duration>);

    fn delete(&self, key: &str) -> bool;

    /// Remove every key the predicate accepts. Returns the removed count.
    fn delete_matching(&self, predicate: &dyn Fn(&str) -> bool) -> usize;

    fn clear(&self);

    /// Remove all expired entries. Returns the removed count.
    fn evict_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key matching a glob pattern such as `user:*`
    fn delete_pattern(&self, pattern: &str) -> Result<usize, PatternError> {
        let pattern = Pattern::new(pattern)?;
        Ok(self.delete_matching(&|key| pattern.matches(key)))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    last_access: Instant,
    access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.stats.expirations += removed as u64;
        removed
    }

    fn evict_lru(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.access_seq)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key);
        self.stats.evictions += 1;
        Some(key)
    }
}

/// In-memory cache provider
pub struct MemoryCache {
    state: Mutex<CacheState>,
    /// 0 = unlimited
    max_entries: usize,
    default_ttl: Option<Duration>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl MemoryCache {
    /// Create a cache holding at most `max_entries` (0 = unlimited)
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries,
            default_ttl: None,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// TTL applied to writes that don't specify one
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> CacheStats {
        self.state().stats
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheProvider for MemoryCache {
    fn read(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.state();

        let expired = match state.entries.get(key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            trace!(key, "Purging expired cache entry on read");
            state.entries.remove(key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return None;
        }

        let seq = state.tick();
        state.stats.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_access = now;
        entry.access_seq = seq;
        Some(entry.value.clone())
    }

    fn write(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.or(self.default_ttl);
        let mut state = self.state();

        if self.max_entries > 0
            && !state.entries.contains_key(key)
            && state.entries.len() >= self.max_entries
        {
            // Expired entries go first; only then does a live entry pay
            if state.purge_expired(now) == 0 {
                if let Some(evicted) = state.evict_lru() {
                    debug!(evicted = %evicted, "Evicted least recently used cache entry");
                }
            }
        }

        let seq = state.tick();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                // A TTL past the end of the clock never expires
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                last_access: now,
                access_seq: seq,
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.state().entries.remove(key).is_some()
    }

    fn delete_matching(&self, predicate: &dyn Fn(&str) -> bool) -> usize {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|key, _| !predicate(key));
        before - state.entries.len()
    }

    fn clear(&self) {
        self.state().entries.clear();
    }

    fn evict_expired(&self) -> usize {
        let removed = self.state().purge_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    fn len(&self) -> usize {
        self.state().entries.len()
    }
}

/// Periodically sweep expired entries until `shutdown` is cancelled
pub fn spawn_expiry_sweeper(
    cache: Arc<dyn CacheProvider>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    cache.evict_expired();
                }
            }
        }
    })
}
