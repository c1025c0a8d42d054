//! Time-bounded response cache with lazy eviction.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at_millis: u64,
}

/// Key→value store where every entry expires a fixed TTL after insertion.
///
/// Eviction is lazy: an expired entry is removed the moment a read notices it,
/// and `get` behaves as a miss. There is no background sweep inside the cache
/// itself; pair it with [`crate::sweep`] when reads are too rare to keep the
/// map bounded.
///
/// Clones share the same underlying map via `Arc`, so all handles observe the
/// same entries.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries), ttl: self.ttl, clock: Arc::clone(&self.clock) }
    }
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache whose entries live for `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_clock_arc(Arc::new(clock))
    }

    pub(crate) fn with_clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store `value` under `key`, replacing any previous entry and restarting
    /// its TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut entries = self.entries.lock().expect("cache map poisoned");
        entries.insert(
            key,
            CacheEntry { value, inserted_at_millis: self.clock.now_millis() },
        );
    }

    /// Fetch a live value, or `None` on absence *or* expiry.
    ///
    /// An expired entry is deleted as a side effect of the read.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("cache map poisoned");
        match entries.get(key) {
            Some(entry) if !self.expired(entry, now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.remove(key);
        tracing::debug!(key, "cache entry expired; evicted on read");
        None
    }

    /// Remove an entry unconditionally, returning its value if one was live.
    pub fn remove(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("cache map poisoned");
        entries.remove(key).filter(|entry| !self.expired(entry, now)).map(|entry| entry.value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().expect("cache map poisoned").clear();
    }

    /// Number of entries currently held, expired stragglers included.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("cache map poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry, now));
        before - entries.len()
    }

    fn expired(&self, entry: &CacheEntry<V>, now_millis: u64) -> bool {
        let ttl_millis = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        now_millis.saturating_sub(entry.inserted_at_millis) >= ttl_millis
    }
}
